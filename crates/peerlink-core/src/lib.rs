//! Peerlink - lazy connection manager for remote peers.
//!
//! A [`PeerManager`] lets callers issue requests against a remote peer without
//! ever deciding when that peer is connected or released. It connects on
//! first use, queues requests issued while the connection is coming up, times
//! out requests that get no reply, releases the connection after an idle
//! period and recovers from the peer dying.
//!
//! The transport is pluggable through [`PeerConnector`]. The [`ipc`] module
//! provides one over loopback TCP.
//!
//! # Example
//!
//! ```rust,ignore
//! use peerlink::ipc::{IpcClient, TcpConnector};
//! use peerlink::{NoopObserver, PeerConfig, PeerManager, RequestTicket, TrackedRequest};
//! use std::sync::Arc;
//!
//! struct Ping;
//!
//! impl TrackedRequest<TcpConnector> for Ping {
//!     fn run(&mut self, client: &IpcClient, ticket: RequestTicket) {
//!         let client = client.clone();
//!         tokio::spawn(async move {
//!             let reply = client.call("ping", serde_json::json!({})).await;
//!             if ticket.complete() {
//!                 println!("reply: {:?}", reply);
//!             }
//!         });
//!     }
//!
//!     fn on_timeout(&mut self, _peer: &PeerManager<TcpConnector>) {
//!         println!("no reply");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> peerlink::Result<()> {
//!     let identity = TcpConnector::identity_for("127.0.0.1:7400".parse().unwrap(), "Echo", 0);
//!     let peer = PeerManager::new(
//!         identity,
//!         Arc::new(TcpConnector::new()),
//!         PeerConfig::default(),
//!         Arc::new(NoopObserver),
//!     )?;
//!
//!     // Connects, runs, and unbinds again after the idle timeout.
//!     peer.submit(Ping);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod observer;
pub mod registry;
pub mod request;
pub mod status;

mod connection;
mod connector;
mod lane;
mod manager;
mod queue;

// Re-export commonly used types
pub use config::{BindFlags, IpcConfig, PeerConfig, PeerDefaults, PendingPolicy, SupersedePolicy};
pub use connection::ConnectionState;
pub use connector::{BindCallback, DeathRecipient, LinkEvent, PeerConnector};
pub use error::{PeerError, Result};
pub use identity::PeerIdentity;
pub use lane::TimerToken;
pub use manager::PeerManager;
pub use observer::{NoopObserver, PeerObserver};
pub use registry::PeerRegistry;
pub use request::{
    AbandonReason, RequestId, RequestPhase, RequestTicket, TrackedRequest, UntrackedRequest,
};
pub use status::PeerStatus;
