//! [`PeerConnector`] for peers hosted by an [`IpcServer`](super::IpcServer).
//!
//! The peer's `process` field is its socket address (`127.0.0.1:PORT`).
//! Connecting spawns the TCP connect and reports back through the bind
//! callback; EOF on the link is the death notification.

use super::client::{IpcClient, IpcLink};
use crate::config::BindFlags;
use crate::connector::{BindCallback, DeathRecipient, PeerConnector};
use crate::error::Result;
use crate::identity::PeerIdentity;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

struct Attempt {
    id: u64,
    task: Option<AbortHandle>,
    link: Option<IpcLink>,
}

#[derive(Default)]
struct ConnectorState {
    attempts: HashMap<PeerIdentity, Attempt>,
}

/// Connects managers to IPC peers over loopback TCP.
#[derive(Clone, Default)]
pub struct TcpConnector {
    state: Arc<Mutex<ConnectorState>>,
    next_attempt: Arc<AtomicU64>,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity addressing the peer listening on `addr`.
    pub fn identity_for(
        addr: SocketAddr,
        component: impl Into<String>,
        user_id: u32,
    ) -> PeerIdentity {
        PeerIdentity::new(addr.to_string(), component, user_id)
    }

    /// Number of peers with a live link or a pending attempt.
    pub fn active(&self) -> usize {
        self.lock().attempts.len()
    }

    fn lock(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PeerConnector for TcpConnector {
    type Handle = IpcLink;
    type Interface = IpcClient;

    fn connect(
        &self,
        identity: &PeerIdentity,
        flags: BindFlags,
        callback: BindCallback<IpcLink>,
    ) -> bool {
        let addr: SocketAddr = match identity.process.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!("Cannot connect to {}: bad address ({})", identity, e);
                return false;
            }
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Cannot connect to {}: no tokio runtime", identity);
            return false;
        };

        let id = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        debug!("Connecting to {} at {} (flags {})", identity, addr, flags);

        let mut state = self.lock();
        if let Some(previous) = state.attempts.remove(identity) {
            close_attempt(previous);
        }

        let shared = self.state.clone();
        let key = identity.clone();
        let task = runtime.spawn(async move {
            match IpcLink::connect(addr).await {
                Ok(link) => {
                    {
                        let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        match state.attempts.get_mut(&key) {
                            Some(attempt) if attempt.id == id => {
                                attempt.task = None;
                                attempt.link = Some(link.clone());
                            }
                            _ => {
                                debug!("Dropping link to {}: attempt was cancelled", key);
                                link.close();
                                return;
                            }
                        }
                    }
                    if !callback.connected(link.clone()) {
                        link.close();
                    }
                }
                Err(e) => {
                    {
                        let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        if state.attempts.get(&key).is_some_and(|a| a.id == id) {
                            state.attempts.remove(&key);
                        }
                    }
                    callback.failed(e.to_string());
                }
            }
        });

        state.attempts.insert(
            identity.clone(),
            Attempt {
                id,
                task: Some(task.abort_handle()),
                link: None,
            },
        );
        true
    }

    fn disconnect(&self, identity: &PeerIdentity) {
        let attempt = self.lock().attempts.remove(identity);
        if let Some(attempt) = attempt {
            debug!("Disconnecting from {}", identity);
            close_attempt(attempt);
        }
    }

    fn link_to_death(&self, handle: &IpcLink, recipient: DeathRecipient) -> Result<()> {
        handle.link_to_death(recipient)
    }

    fn unlink_to_death(&self, handle: &IpcLink) {
        handle.unlink_to_death();
    }

    fn interface(&self, handle: &IpcLink) -> IpcClient {
        IpcClient::new(handle.clone())
    }
}

fn close_attempt(attempt: Attempt) {
    if let Some(task) = attempt.task {
        task.abort();
    }
    if let Some(link) = attempt.link {
        link.close();
    }
}
