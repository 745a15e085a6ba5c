//! Units of work run against a peer.
//!
//! A tracked request expects a reply: it gets a [`RequestTicket`] carrying
//! the timeout state machine
//!
//! ```text
//! Armed ──complete()──▶ Completed
//!   │ ───cancel()────▶ Cancelled
//!   └────timer───────▶ TimedOut
//! ```
//!
//! Every terminal phase is final. Whichever transition happens first wins,
//! the others return `false`, so a late reply after a timeout (or a timeout
//! after a reply) has no effect.
//!
//! An untracked request is a single closure run against the live interface.

use crate::connector::PeerConnector;
use crate::error::Result;
use crate::lane::TimerToken;
use crate::manager::PeerManager;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Identifier of a tracked request, unique per manager.
pub type RequestId = u64;

/// Fire-and-forget operation run once against the live interface.
pub type UntrackedRequest<I> = Box<dyn FnOnce(&I) -> Result<()> + Send + 'static>;

/// Lifecycle phase of a tracked request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPhase {
    /// Waiting for a reply; the timeout is pending.
    Armed,
    Completed,
    Cancelled,
    TimedOut,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestPhase::Armed)
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestPhase::Armed => write!(f, "ARMED"),
            RequestPhase::Completed => write!(f, "COMPLETED"),
            RequestPhase::Cancelled => write!(f, "CANCELLED"),
            RequestPhase::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Why the manager gave up on a tracked request without running it to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// A newer request replaced it under the single-pending policy.
    Superseded,
    /// It arrived while another request was unresolved under the
    /// single-pending reject policy.
    Rejected,
    /// The peer died or could not be bound while it was queued.
    PeerUnavailable,
    /// The manager was destroyed.
    Destroyed,
    /// A final request already ran.
    SessionCompleted,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbandonReason::Superseded => "superseded",
            AbandonReason::Rejected => "rejected",
            AbandonReason::PeerUnavailable => "peer unavailable",
            AbandonReason::Destroyed => "manager destroyed",
            AbandonReason::SessionCompleted => "session completed",
        };
        write!(f, "{}", s)
    }
}

/// A request that expects a reply from the peer.
///
/// `run` is called at most once, on the manager's lane, with the live
/// interface. The reply usually arrives later; whoever receives it calls
/// [`RequestTicket::complete`] and only delivers the reply if that returns
/// `true`.
pub trait TrackedRequest<P: PeerConnector>: Send + 'static {
    /// Issue the request against the live interface.
    fn run(&mut self, interface: &P::Interface, ticket: RequestTicket);

    /// Called when no reply arrived within the timeout.
    fn on_timeout(&mut self, peer: &PeerManager<P>);

    /// Called when the manager drops the request without `run` ever
    /// completing it.
    fn on_abandoned(&mut self, reason: AbandonReason) {
        debug!("{} abandoned: {}", self.label(), reason);
    }

    /// A final request marks the end of the session: nothing runs after it.
    fn is_final(&self) -> bool {
        false
    }

    /// Per-request timeout. `None` uses the manager's configured default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Name used in log lines.
    fn label(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Shared handle to a tracked request's phase.
///
/// Cheap to clone; may be completed or cancelled from any thread. Holds only
/// a non-owning link back to the manager.
#[derive(Clone)]
pub struct RequestTicket {
    inner: Arc<TicketInner>,
}

struct TicketInner {
    id: RequestId,
    state: Mutex<TicketState>,
    notify: Arc<dyn Fn(RequestId) -> bool + Send + Sync>,
}

struct TicketState {
    phase: RequestPhase,
    timer: Option<TimerToken>,
}

impl RequestTicket {
    pub(crate) fn new(id: RequestId, notify: Arc<dyn Fn(RequestId) -> bool + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(TicketInner {
                id,
                state: Mutex::new(TicketState {
                    phase: RequestPhase::Armed,
                    timer: None,
                }),
                notify,
            }),
        }
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn phase(&self) -> RequestPhase {
        self.lock().phase
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == RequestPhase::Cancelled
    }

    /// Whether the request reached any terminal phase.
    pub fn is_done(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Mark the request as answered.
    ///
    /// Returns `false` if it was already completed, cancelled or timed out,
    /// in which case the reply must be ignored.
    pub fn complete(&self) -> bool {
        self.finish(RequestPhase::Completed, true)
    }

    /// Cancel the request. Does not interrupt a call already in flight.
    ///
    /// Returns `false` if the request was already terminal.
    pub fn cancel(&self) -> bool {
        self.finish(RequestPhase::Cancelled, true)
    }

    /// Timer path, applied on the lane.
    pub(crate) fn time_out(&self) -> bool {
        self.finish(RequestPhase::TimedOut, false)
    }

    /// Cancellation decided by the lane itself, which already forgot the
    /// request and needs no notification.
    pub(crate) fn cancel_quietly(&self) -> bool {
        self.finish(RequestPhase::Cancelled, false)
    }

    /// Attach the timeout timer. A ticket that is already terminal cancels
    /// it right away.
    pub(crate) fn arm(&self, timer: TimerToken) {
        let mut state = self.lock();
        if state.phase.is_terminal() {
            timer.cancel();
        } else if let Some(previous) = state.timer.replace(timer) {
            previous.cancel();
        }
    }

    fn finish(&self, to: RequestPhase, notify: bool) -> bool {
        let timer = {
            let mut state = self.lock();
            if state.phase.is_terminal() {
                return false;
            }
            state.phase = to;
            state.timer.take()
        };

        if let Some(timer) = timer {
            timer.cancel();
        }
        if notify {
            (self.inner.notify)(self.inner.id);
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, TicketState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RequestTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTicket")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .finish()
    }
}
