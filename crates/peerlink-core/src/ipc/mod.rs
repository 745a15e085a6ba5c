//! Loopback IPC transport.
//!
//! A concrete peer kind for [`PeerManager`](crate::PeerManager): peers are
//! processes serving length-prefixed JSON-RPC 2.0 over `127.0.0.1` TCP.
//!
//! # Architecture
//!
//! - **Server**: hosts a peer, accepts connections, dispatches method calls
//! - **Client**: one live link to a peer, pipelines calls and detects death
//! - **Connector**: plugs the client into the manager's connect and death hooks
//! - **Call**: a tracked request delivering one JSON-RPC result on a channel
//! - **Protocol**: shared framing and JSON-RPC types used by all of them

pub mod call;
pub mod client;
pub mod connector;
pub mod protocol;
pub mod server;

pub use call::RpcCall;
pub use client::{IpcClient, IpcLink};
pub use connector::TcpConnector;
pub use protocol::{IpcError, IpcRequest, IpcResponse};
pub use server::{IpcDispatch, IpcServer, IpcServerHandle};
