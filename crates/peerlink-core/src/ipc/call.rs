//! Ready-made tracked request for IPC peers.

use super::client::IpcClient;
use super::connector::TcpConnector;
use crate::manager::PeerManager;
use crate::request::{AbandonReason, RequestTicket, TrackedRequest};
use crate::{PeerError, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// One JSON-RPC call whose outcome is delivered on a oneshot channel.
///
/// The receiver gets exactly one value: the reply, a timeout, or the reason
/// the manager gave up on the call.
pub struct RpcCall {
    method: String,
    params: serde_json::Value,
    timeout: Option<Duration>,
    is_final: bool,
    reply: ReplySlot,
}

/// Shared by the request and the task awaiting the reply; whichever outcome
/// wins the ticket takes the sender.
#[derive(Clone)]
struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<Result<serde_json::Value>>>>>);

impl ReplySlot {
    fn send(&self, outcome: Result<serde_json::Value>) {
        let sender = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }
}

impl RpcCall {
    pub fn new(
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> (Self, oneshot::Receiver<Result<serde_json::Value>>) {
        let (tx, rx) = oneshot::channel();
        let call = Self {
            method: method.into(),
            params,
            timeout: None,
            is_final: false,
            reply: ReplySlot(Arc::new(Mutex::new(Some(tx)))),
        };
        (call, rx)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark this call as the last one of the session.
    pub fn final_call(mut self) -> Self {
        self.is_final = true;
        self
    }
}

impl TrackedRequest<TcpConnector> for RpcCall {
    fn run(&mut self, client: &IpcClient, ticket: RequestTicket) {
        let reply = self.reply.clone();
        let client = client.clone();
        let method = self.method.clone();
        let params = std::mem::take(&mut self.params);

        tokio::spawn(async move {
            let outcome = client.call(&method, params).await;
            if ticket.complete() {
                reply.send(outcome);
            } else {
                debug!("Ignoring late reply to {} (request #{})", method, ticket.id());
            }
        });
    }

    fn on_timeout(&mut self, peer: &PeerManager<TcpConnector>) {
        let timeout = self
            .timeout
            .unwrap_or_else(|| Duration::from_millis(peer.status().request_timeout_ms));
        self.reply.send(Err(PeerError::Timeout(timeout)));
    }

    fn on_abandoned(&mut self, reason: AbandonReason) {
        debug!("{} abandoned: {}", self.method, reason);
        self.reply.send(Err(PeerError::Abandoned(reason)));
    }

    fn is_final(&self) -> bool {
        self.is_final
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn label(&self) -> &str {
        &self.method
    }
}
