//! TCP IPC server hosting a peer.
//!
//! Listens on `127.0.0.1` (OS-assigned port unless one is given), accepts
//! connections and dispatches JSON-RPC method calls to an [`IpcDispatch`].
//!
//! # Concurrency
//!
//! The server runs on the tokio runtime. Each connection is handled in its own
//! spawned task, and each request on a connection is dispatched in its own
//! task, so a slow call never holds up the ones pipelined behind it. Responses
//! are written by a single writer task per connection and may leave in a
//! different order than the requests arrived; clients match them by id.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::{PeerError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running IPC server. Dropping shuts down the server.
pub struct IpcServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl IpcServerHandle {
    /// Get the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down the server.
    ///
    /// Stops accepting new connections and closes every active one, which
    /// clients observe as the peer dying.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Wait for the accept loop to exit after [`IpcServerHandle::shutdown`].
    pub async fn join(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for IpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Method table of a hosted peer.
#[async_trait::async_trait]
pub trait IpcDispatch: Send + Sync + 'static {
    /// Dispatch a JSON-RPC method call and return the result.
    async fn dispatch(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value>;
}

/// IPC server that listens for client connections.
pub struct IpcServer;

impl IpcServer {
    /// Start the IPC server on a random local port.
    pub async fn start<D: IpcDispatch>(dispatch: Arc<D>) -> Result<IpcServerHandle> {
        Self::start_on_port(dispatch, 0).await
    }

    /// Start the IPC server on the given local port (0 picks one).
    ///
    /// The server runs in background tokio tasks.
    pub async fn start_on_port<D: IpcDispatch>(
        dispatch: Arc<D>,
        port: u16,
    ) -> Result<IpcServerHandle> {
        let listener = TcpListener::bind((IpcConfig::BIND_HOST, port)).await?;
        let addr = listener.local_addr()?;

        info!("IPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            dispatch,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(IpcServerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop<D: IpcDispatch>(
        listener: TcpListener,
        dispatch: Arc<D>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting IPC connection from {}: at max capacity ({})",
                                    peer_addr,
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let dispatch = dispatch.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("IPC connection from {}", peer_addr);
                                let served =
                                    Self::handle_connection(stream, dispatch, conn_shutdown).await;
                                if let Err(e) = served {
                                    debug!("IPC connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection<D: IpcDispatch>(
        stream: TcpStream,
        dispatch: Arc<D>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<IpcResponse>();

        let writer_task = tokio::spawn(async move {
            while let Some(response) = out_rx.recv().await {
                let bytes = serde_json::to_vec(&response)?;
                write_frame(&mut writer, &bytes).await?;
            }
            Ok::<(), PeerError>(())
        });

        let result = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Server shutting down
                }
            };

            let request_str = match String::from_utf8(frame) {
                Ok(s) => s,
                Err(_) => {
                    break Err(PeerError::Validation {
                        field: "ipc_payload".to_string(),
                        message: "Invalid UTF-8 in IPC frame".to_string(),
                    })
                }
            };

            let dispatch = dispatch.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                if let Some(response) = Self::process_request(&request_str, &*dispatch).await {
                    let _ = out_tx.send(response);
                }
            });
        };

        // Closing both halves is what the client sees as peer death.
        writer_task.abort();
        result
    }

    async fn process_request<D: IpcDispatch>(
        request_str: &str,
        dispatch: &D,
    ) -> Option<IpcResponse> {
        let request: IpcRequest = match serde_json::from_str(request_str) {
            Ok(req) => req,
            Err(e) => {
                return Some(IpcResponse::error(None, -32700, format!("Parse error: {}", e)));
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(IpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            ));
        }

        let params = request.params.unwrap_or(serde_json::Value::Object(Default::default()));
        let outcome = dispatch.dispatch(&request.method, params).await;

        let Some(id) = request.id else {
            if let Err(e) = outcome {
                debug!("IPC notification {} failed: {}", request.method, e);
            }
            return None;
        };

        Some(match outcome {
            Ok(result) => IpcResponse::success(Some(id), result),
            Err(e) => IpcResponse::error(Some(id), e.to_rpc_error_code(), e.to_string()),
        })
    }
}
