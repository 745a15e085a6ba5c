//! Serialized execution lane.
//!
//! A lane is one tokio task draining an unbounded FIFO channel, so every
//! message posted to it is applied in submission order and never overlaps
//! another. All manager state lives on its lane; entry points only post.
//!
//! The [`Lane`] handle kept by the worker (and cloned into timers, tickets and
//! connector callbacks) holds a weak sender: it never keeps the lane alive.
//! The lane stops once every strong sender, i.e. every `PeerManager` handle,
//! is gone.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::task::AbortHandle;
use tracing::trace;

/// Create the channel backing a lane.
pub(crate) fn channel<M>() -> (UnboundedSender<M>, UnboundedReceiver<M>, Lane<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let lane = Lane {
        tx: tx.downgrade(),
    };
    (tx, rx, lane)
}

/// Non-owning handle for posting messages onto a lane.
pub struct Lane<M> {
    tx: WeakUnboundedSender<M>,
}

impl<M> Clone for Lane<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> Lane<M> {
    /// Post a message. Returns false if the lane is gone.
    pub fn post(&self, msg: M) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Strong sender, if some owner still keeps the lane alive.
    pub(crate) fn upgrade(&self) -> Option<UnboundedSender<M>> {
        self.tx.upgrade()
    }

    /// Post a message once `delay` has elapsed.
    pub fn post_after(&self, delay: Duration, msg: M) -> TimerToken {
        self.post_after_with(delay, msg, || trace!("lane closed before delayed message"))
    }

    /// Like [`Lane::post_after`], running `on_closed` instead if the lane is
    /// gone by the time the delay elapses.
    pub fn post_after_with<F>(&self, delay: Duration, msg: M, on_closed: F) -> TimerToken
    where
        F: FnOnce() + Send + 'static,
    {
        let weak = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let delivered = match weak.upgrade() {
                Some(tx) => tx.send(msg).is_ok(),
                None => false,
            };
            if !delivered {
                on_closed();
            }
        });
        TimerToken {
            handle: task.abort_handle(),
        }
    }

    /// Type-erased sink that maps `T` into a lane message.
    ///
    /// Used to hand callbacks to code that must not see the lane's message
    /// type (connectors, request tickets).
    pub fn sink<T, F>(&self, map: F) -> Arc<dyn Fn(T) -> bool + Send + Sync>
    where
        T: 'static,
        F: Fn(T) -> M + Send + Sync + 'static,
    {
        let lane = self.clone();
        Arc::new(move |value| lane.post(map(value)))
    }
}

/// Cancellation token for a delayed post.
///
/// Cancelling is best effort: a message whose delay already elapsed may be
/// sitting in the lane's queue, so the receiver must still validate it.
#[derive(Debug)]
pub struct TimerToken {
    handle: AbortHandle,
}

impl TimerToken {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}
