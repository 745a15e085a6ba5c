//! TCP IPC client: one live link to a hosted peer.
//!
//! An [`IpcLink`] owns one connection. A reader task routes each response to
//! the call waiting on its id, so calls from many tasks can be in flight at
//! once. When the connection hits EOF or a read error the link is dead: every
//! waiting call fails and the registered death notification fires, once.
//!
//! # Thread Safety
//!
//! Writes are serialized by a tokio `Mutex` around the write half; the
//! routing table and death registration sit behind short-lived std locks that
//! are never held across an await.

use super::protocol::{read_frame, write_frame, IpcRequest, IpcResponse};
use crate::config::IpcConfig;
use crate::connector::DeathRecipient;
use crate::{PeerError, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

type Waiters = HashMap<u64, oneshot::Sender<IpcResponse>>;

struct LinkShared {
    addr: SocketAddr,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    waiters: Mutex<Waiters>,
    death: Mutex<Option<DeathRecipient>>,
    dead: AtomicBool,
    next_id: AtomicU64,
    reader: Mutex<Option<AbortHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinkShared {
    fn unavailable(&self) -> PeerError {
        PeerError::PeerUnavailable {
            identity: self.addr.to_string(),
        }
    }

    /// Mark the link dead and fail every waiting call.
    ///
    /// Returns true for the call that performed the transition.
    fn mark_dead(&self) -> bool {
        if self.dead.swap(true, Ordering::SeqCst) {
            return false;
        }
        let waiters = std::mem::take(&mut *lock(&self.waiters));
        if !waiters.is_empty() {
            debug!("Failing {} in-flight calls to {}", waiters.len(), self.addr);
        }
        // Dropping the senders wakes the waiters with an error.
        drop(waiters);
        true
    }
}

/// One live TCP connection to a hosted peer.
#[derive(Clone)]
pub struct IpcLink {
    shared: Arc<LinkShared>,
}

impl std::fmt::Debug for IpcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcLink")
            .field("addr", &self.shared.addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl IpcLink {
    /// Connect to a peer's IPC server.
    ///
    /// Uses the configured connection timeout from `IpcConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::LinkFailed {
                identity: addr.to_string(),
                message: format!("connect timed out after {:?}", IpcConfig::CONNECT_TIMEOUT),
            })?
            .map_err(|e| PeerError::LinkFailed {
                identity: addr.to_string(),
                message: e.to_string(),
            })?;

        debug!("IPC link connected to {}", addr);
        Ok(Self::from_stream(addr, stream))
    }

    fn from_stream(addr: SocketAddr, stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        let shared = Arc::new(LinkShared {
            addr,
            writer: tokio::sync::Mutex::new(Some(writer)),
            waiters: Mutex::new(HashMap::new()),
            death: Mutex::new(None),
            dead: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            reader: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(reader, Arc::downgrade(&shared)));
        *lock(&shared.reader) = Some(task.abort_handle());
        Self { shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn is_alive(&self) -> bool {
        !self.shared.dead.load(Ordering::SeqCst)
    }

    /// Register the notification fired when the link dies.
    ///
    /// Fails if the link is already dead.
    pub fn link_to_death(&self, recipient: DeathRecipient) -> Result<()> {
        let mut slot = lock(&self.shared.death);
        if !self.is_alive() {
            return Err(self.shared.unavailable());
        }
        *slot = Some(recipient);
        Ok(())
    }

    pub fn unlink_to_death(&self) {
        lock(&self.shared.death).take();
    }

    /// Close the connection without firing the death notification.
    pub fn close(&self) {
        lock(&self.shared.death).take();
        if !self.shared.mark_dead() {
            return;
        }
        debug!("Closing IPC link to {}", self.shared.addr);
        if let Some(reader) = lock(&self.shared.reader).take() {
            reader.abort();
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            // Dropping the write half sends FIN.
            shared.writer.lock().await.take();
        });
    }

    /// Call a method and wait for its response.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = IpcRequest::new(method, params, id);
        let request_bytes = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.shared.waiters);
            if !self.is_alive() {
                return Err(self.shared.unavailable());
            }
            waiters.insert(id, tx);
        }

        if let Err(e) = self.send(&request_bytes).await {
            lock(&self.shared.waiters).remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| self.shared.unavailable())?;
        response.into_result()
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let request = IpcRequest::notification(method, params);
        let request_bytes = serde_json::to_vec(&request)?;
        self.send(&request_bytes).await
    }

    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(self.shared.unavailable());
        };
        write_frame(writer, bytes)
            .await
            .map_err(|_| self.shared.unavailable())
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: std::sync::Weak<LinkShared>) {
    loop {
        let frame = read_frame(&mut reader).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };

        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("IPC peer {} closed the connection", shared.addr);
                break fire_death(&shared);
            }
            Err(e) => {
                warn!("IPC read from {} failed: {}", shared.addr, e);
                break fire_death(&shared);
            }
        };

        let response: IpcResponse = match serde_json::from_slice(&bytes) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping unparsable IPC response from {}: {}", shared.addr, e);
                continue;
            }
        };

        let Some(id) = response.numeric_id() else {
            warn!("Dropping IPC response without id from {}", shared.addr);
            continue;
        };
        let waiter = lock(&shared.waiters).remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No caller waiting for IPC response #{} from {}", id, shared.addr),
        }
    }
}

fn fire_death(shared: &LinkShared) {
    if shared.mark_dead() {
        let recipient = lock(&shared.death).take();
        if let Some(recipient) = recipient {
            recipient.died();
        }
    }
}

/// Typed interface handed to requests running against an IPC peer.
#[derive(Debug, Clone)]
pub struct IpcClient {
    link: IpcLink,
}

impl IpcClient {
    pub fn new(link: IpcLink) -> Self {
        Self { link }
    }

    /// Connect directly, outside of a manager.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self::new(IpcLink::connect(addr).await?))
    }

    /// Call a JSON-RPC method on the peer.
    pub async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        self.link.call(method, params).await
    }

    /// Fire-and-forget notification, sent from a background task.
    ///
    /// Fails right away only if the link is already dead.
    pub fn notify(&self, method: &str, params: serde_json::Value) -> Result<()> {
        if !self.link.is_alive() {
            return Err(self.link.shared.unavailable());
        }
        let link = self.link.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(e) = link.notify(&method, params).await {
                debug!("IPC notification {} to {} failed: {}", method, link.addr(), e);
            }
        });
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        self.link.addr()
    }

    pub fn is_alive(&self) -> bool {
        self.link.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::{IpcDispatch, IpcServer};
    use std::time::Duration;

    struct TestDispatch;

    #[async_trait::async_trait]
    impl IpcDispatch for TestDispatch {
        async fn dispatch(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value> {
            match method {
                "ping" => Ok(serde_json::json!("pong")),
                "add" => {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!(a + b))
                }
                "sleep" => {
                    let ms = params["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(serde_json::json!(ms))
                }
                _ => Err(PeerError::InvalidParams {
                    message: format!("Unknown method: {}", method),
                }),
            }
        }
    }

    fn death_flag() -> (DeathRecipient, Arc<std::sync::atomic::AtomicUsize>) {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = count.clone();
        let recipient = DeathRecipient::new(Arc::new(move |()| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        }));
        (recipient, count)
    }

    #[tokio::test]
    async fn test_client_call_success() {
        let mut handle = IpcServer::start(Arc::new(TestDispatch)).await.unwrap();
        let client = IpcClient::connect(handle.addr()).await.unwrap();

        let result = client.call("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("pong"));

        let result = client
            .call("add", serde_json::json!({"a": 3, "b": 4}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(7));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_client_call_error_returns_rpc_error() {
        let mut handle = IpcServer::start(Arc::new(TestDispatch)).await.unwrap();
        let client = IpcClient::connect(handle.addr()).await.unwrap();

        let result = client.call("nonexistent", serde_json::json!({})).await;
        assert!(matches!(result, Err(PeerError::Rpc { code: -32602, .. })));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_routed_by_id() {
        let mut handle = IpcServer::start(Arc::new(TestDispatch)).await.unwrap();
        let client = IpcClient::connect(handle.addr()).await.unwrap();

        let slow = client.call("sleep", serde_json::json!({"ms": 100}));
        let fast = client.call("add", serde_json::json!({"a": 1, "b": 1}));
        let (slow, fast) = tokio::join!(slow, fast);

        assert_eq!(slow.unwrap(), serde_json::json!(100));
        assert_eq!(fast.unwrap(), serde_json::json!(2));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_fails() {
        // Use a port that nothing is listening on
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match IpcLink::connect(addr).await {
            Err(PeerError::LinkFailed { identity, .. }) => assert_eq!(identity, "127.0.0.1:1"),
            other => panic!("Expected LinkFailed, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_shutdown_fires_death_once() {
        let mut handle = IpcServer::start(Arc::new(TestDispatch)).await.unwrap();
        let link = IpcLink::connect(handle.addr()).await.unwrap();
        let (recipient, deaths) = death_flag();
        link.link_to_death(recipient).unwrap();

        // Verify it works first
        assert!(link.call("ping", serde_json::json!({})).await.is_ok());

        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.call("sleep", serde_json::json!({"ms": 5000})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PeerError::PeerUnavailable { .. })));
        assert!(!link.is_alive());
        assert_eq!(deaths.load(Ordering::SeqCst), 1);

        // Dead links refuse new registrations and calls.
        let (again, _) = death_flag();
        assert!(link.link_to_death(again).is_err());
        assert!(link.call("ping", serde_json::json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_close_does_not_fire_death() {
        let mut handle = IpcServer::start(Arc::new(TestDispatch)).await.unwrap();
        let link = IpcLink::connect(handle.addr()).await.unwrap();
        let (recipient, deaths) = death_flag();
        link.link_to_death(recipient).unwrap();

        link.close();
        link.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!link.is_alive());
        assert_eq!(deaths.load(Ordering::SeqCst), 0);
        handle.shutdown();
    }
}
