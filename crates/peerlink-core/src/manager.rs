//! Peer lifecycle manager.
//!
//! [`PeerManager`] is a cheap, cloneable handle. Every operation on it is
//! posted to the manager's lane, where a single worker owns the connection,
//! the pending queue, the outstanding tracked requests and all timers. The
//! worker applies one command at a time, so none of that state needs a lock.
//!
//! Flow for a submitted request:
//!
//! 1. the idle-unbind timer is cancelled and the request's timeout is armed;
//! 2. if the connection is not live, the request is queued and a connect
//!    attempt is started (at most one at a time);
//! 3. once connected the queue is drained in submission order;
//! 4. when the last unit of work resolves, idle unbind is armed again.

use crate::config::{PeerConfig, PendingPolicy};
use crate::connection::{BindAttempt, ConnectOutcome, Connection, DeathOutcome, UnbindOutcome};
use crate::connector::{BindCallback, DeathRecipient, LinkEvent, PeerConnector};
use crate::error::{PeerError, Result};
use crate::identity::PeerIdentity;
use crate::lane::{self, Lane, TimerToken};
use crate::observer::PeerObserver;
use crate::queue::{admit, Admission, Pending, PendingQueue, TrackedEntry};
use crate::request::{AbandonReason, RequestId, RequestTicket, TrackedRequest, UntrackedRequest};
use crate::status::PeerStatus;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Messages applied on a manager's lane.
pub(crate) enum Command<P: PeerConnector> {
    Submit(TrackedEntry<P>),
    SubmitUntracked(UntrackedRequest<P::Interface>),
    Link { epoch: u64, event: LinkEvent<P::Handle> },
    Died { epoch: u64 },
    RequestFinished(RequestId),
    RequestTimedOut(RequestId),
    IdleUnbind { generation: u64 },
    Destroy,
    Barrier(oneshot::Sender<()>),
}

/// Handle to a lazily connected remote peer.
///
/// Dropping the last handle destroys the manager.
pub struct PeerManager<P: PeerConnector> {
    tx: UnboundedSender<Command<P>>,
    lane: Lane<Command<P>>,
    status: watch::Receiver<PeerStatus>,
    identity: Arc<PeerIdentity>,
    next_id: Arc<AtomicU64>,
    /// Set as soon as destroy is requested, before the lane applies it.
    destroyed: Arc<AtomicBool>,
}

impl<P: PeerConnector> Clone for PeerManager<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            lane: self.lane.clone(),
            status: self.status.clone(),
            identity: self.identity.clone(),
            next_id: self.next_id.clone(),
            destroyed: self.destroyed.clone(),
        }
    }
}

impl<P: PeerConnector> fmt::Debug for PeerManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerManager")
            .field("identity", &*self.identity)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl<P: PeerConnector> PeerManager<P> {
    /// Create a manager for `identity` and spawn its lane.
    ///
    /// Nothing connects until the first request arrives. Must be called from
    /// within a tokio runtime.
    pub fn new(
        identity: PeerIdentity,
        connector: Arc<P>,
        config: PeerConfig,
        observer: Arc<dyn PeerObserver>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PeerError::config("PeerManager must be created inside a tokio runtime"))?;

        let (tx, rx, lane) = lane::channel();
        let (status_tx, status) = watch::channel(PeerStatus::initial(identity.clone(), &config));
        let next_id = Arc::new(AtomicU64::new(1));
        let destroyed = Arc::new(AtomicBool::new(false));

        let worker = PeerWorker {
            connection: Connection::new(connector, identity.clone(), config.bind_flags()),
            identity: identity.clone(),
            config,
            queue: PendingQueue::default(),
            outstanding: BTreeMap::new(),
            observer,
            lane: lane.clone(),
            status_tx,
            next_id: next_id.clone(),
            destroy_requested: destroyed.clone(),
            destroyed: false,
            completed_all: false,
            idle_timer: None,
            idle_generation: 0,
        };
        runtime.spawn(worker.run(rx));

        debug!("Created peer manager for {}", identity);

        Ok(Self {
            tx,
            lane,
            status,
            identity: Arc::new(identity),
            next_id,
            destroyed,
        })
    }

    pub fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Schedule a tracked request.
    ///
    /// The returned ticket is the same one passed to
    /// [`TrackedRequest::run`]; cancelling it before the request runs keeps
    /// it from ever running.
    pub fn submit<R: TrackedRequest<P>>(&self, request: R) -> RequestTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ticket = RequestTicket::new(id, self.lane.sink(Command::RequestFinished));
        let entry = TrackedEntry {
            ticket: ticket.clone(),
            request: Box::new(request),
        };

        if self.tx.send(Command::Submit(entry)).is_err() {
            debug!("Dropping request #{} for {}: lane stopped", id, self.identity);
            ticket.cancel_quietly();
        }
        ticket
    }

    /// Schedule a request that expects no reply.
    pub fn submit_untracked<F>(&self, request: F)
    where
        F: FnOnce(&P::Interface) -> Result<()> + Send + 'static,
    {
        if self
            .tx
            .send(Command::SubmitUntracked(Box::new(request)))
            .is_err()
        {
            debug!("Dropping async request for {}: lane stopped", self.identity);
        }
    }

    /// Destroy the manager: release the connection and abandon queued work.
    ///
    /// Safe to call any number of times.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Destroy);
    }

    /// Whether the manager has been destroyed or is about to be.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
            || self.status.borrow().destroyed
            || self.tx.is_closed()
    }

    /// Latest published status snapshot.
    pub fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status snapshots.
    pub fn subscribe(&self) -> watch::Receiver<PeerStatus> {
        self.status.clone()
    }

    /// Wait until every operation posted before this call has been applied.
    pub async fn barrier(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// State owned by the lane.
struct PeerWorker<P: PeerConnector> {
    identity: PeerIdentity,
    config: PeerConfig,
    connection: Connection<P>,
    queue: PendingQueue<P>,
    /// Tracked requests that ran and await their reply.
    outstanding: BTreeMap<RequestId, TrackedEntry<P>>,
    observer: Arc<dyn PeerObserver>,
    lane: Lane<Command<P>>,
    status_tx: watch::Sender<PeerStatus>,
    next_id: Arc<AtomicU64>,
    destroy_requested: Arc<AtomicBool>,
    destroyed: bool,
    completed_all: bool,
    idle_timer: Option<TimerToken>,
    idle_generation: u64,
}

impl<P: PeerConnector> PeerWorker<P> {
    async fn run(mut self, mut rx: UnboundedReceiver<Command<P>>) {
        while let Some(command) = rx.recv().await {
            self.apply(command);
            self.reconcile_idle_timer();
            self.publish();
        }

        debug!("Last handle for {} dropped", self.identity);
        self.handle_destroy();
        self.publish();
    }

    fn apply(&mut self, command: Command<P>) {
        match command {
            Command::Submit(entry) => self.handle_submit(entry),
            Command::SubmitUntracked(request) => self.handle_submit_untracked(request),
            Command::Link { epoch, event } => self.handle_link_event(epoch, event),
            Command::Died { epoch } => self.handle_death_notice(epoch),
            Command::RequestFinished(id) => self.handle_request_finished(id),
            Command::RequestTimedOut(id) => self.handle_request_timed_out(id),
            Command::IdleUnbind { generation } => self.handle_idle_unbind(generation),
            Command::Destroy => self.handle_destroy(),
            Command::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    fn check_if_destroyed(&self) -> bool {
        if self.destroyed {
            debug!(
                "Not handling operation as manager for {} is already destroyed",
                self.identity
            );
        }
        self.destroyed
    }

    // Submissions

    fn handle_submit(&mut self, mut entry: TrackedEntry<P>) {
        if self.check_if_destroyed() || self.completed_all {
            debug!("Dropping {} for {}", entry.label(), self.identity);
            entry.ticket.cancel_quietly();
            return;
        }
        if entry.ticket.is_done() {
            debug!("{} was cancelled before it was scheduled", entry.label());
            return;
        }
        self.cancel_scheduled_unbind();

        match admit(self.config.pending_policy, self.unresolved_tracked()) {
            Admission::Accept => {}
            Admission::Supersede(previous) => {
                if let Some(mut old) = self.take_tracked(previous) {
                    debug!("Canceling {} in favor of {}", old.label(), entry.label());
                    if old.ticket.cancel_quietly() {
                        old.request.on_abandoned(AbandonReason::Superseded);
                    }
                }
            }
            Admission::Reject => {
                debug!(
                    "Rejecting {}: another request for {} is unresolved",
                    entry.label(),
                    self.identity
                );
                if entry.ticket.cancel_quietly() {
                    entry.request.on_abandoned(AbandonReason::Rejected);
                }
                return;
            }
        }

        self.arm_request_timeout(&entry);
        self.handle_pending(Pending::Tracked(entry));
    }

    fn handle_submit_untracked(&mut self, request: UntrackedRequest<P::Interface>) {
        if self.check_if_destroyed() || self.completed_all {
            debug!("Dropping async request for {}", self.identity);
            return;
        }
        self.cancel_scheduled_unbind();
        self.handle_pending(Pending::Untracked(request));
    }

    /// Run a request now if bound, otherwise queue it and make sure a
    /// connect attempt is underway.
    fn handle_pending(&mut self, pending: Pending<P>) {
        if self.destroyed || self.completed_all {
            self.abandon(pending, AbandonReason::SessionCompleted);
            return;
        }

        if !self.connection.is_bound() {
            debug!("Queuing {} for {}", pending, self.identity);
            self.queue.push(pending);
            self.ensure_bound();
        } else {
            self.run_now(pending);
        }
    }

    fn run_now(&mut self, pending: Pending<P>) {
        let Some(interface) = self.connection.interface() else {
            return;
        };

        match pending {
            Pending::Tracked(mut entry) => {
                if entry.ticket.is_done() {
                    debug!("Skipping {}: already {}", entry.label(), entry.ticket.phase());
                    return;
                }
                debug!("Running {} against {}", entry.label(), self.identity);
                let is_final = entry.request.is_final();
                entry.request.run(interface, entry.ticket.clone());
                if !entry.ticket.is_done() {
                    self.outstanding.insert(entry.id(), entry);
                }
                if is_final {
                    info!("Final request ran for {}; dropping further work", self.identity);
                    self.completed_all = true;
                }
            }
            Pending::Untracked(request) => {
                debug!("Running async request against {}", self.identity);
                if let Err(e) = request(interface) {
                    warn!("Exception handling async request for {}: {}", self.identity, e);
                }
            }
        }
    }

    /// The tracked request that counts against a single-pending policy.
    fn unresolved_tracked(&self) -> Option<RequestId> {
        if self.config.pending_policy == PendingPolicy::Multiple {
            return None;
        }
        self.outstanding
            .keys()
            .next()
            .copied()
            .or_else(|| self.queue.first_tracked())
    }

    fn take_tracked(&mut self, id: RequestId) -> Option<TrackedEntry<P>> {
        self.outstanding
            .remove(&id)
            .or_else(|| self.queue.remove_tracked(id))
    }

    // Request timeouts

    fn arm_request_timeout(&self, entry: &TrackedEntry<P>) {
        let timeout = entry.request.timeout().unwrap_or(self.config.request_timeout);
        let id = entry.id();
        let identity = self.identity.clone();
        let token = self.lane.post_after_with(timeout, Command::RequestTimedOut(id), move || {
            warn!("Request #{} for {} timed out (no peer)", id, identity);
        });
        entry.ticket.arm(token);
    }

    fn handle_request_finished(&mut self, id: RequestId) {
        if self.take_tracked(id).is_some() {
            debug!("Request #{} for {} finished", id, self.identity);
        }
    }

    fn handle_request_timed_out(&mut self, id: RequestId) {
        if self.check_if_destroyed() {
            return;
        }
        let Some(mut entry) = self.take_tracked(id) else {
            return;
        };
        if !entry.ticket.time_out() {
            return;
        }

        let timeout = entry.request.timeout().unwrap_or(self.config.request_timeout);
        match self.resolve_handle() {
            Some(peer) => {
                warn!("{} timed out after {:?}", entry.label(), timeout);
                entry.request.on_timeout(&peer);
            }
            None => warn!("{} timed out (no peer)", entry.label()),
        }
    }

    /// Build a handle for callbacks, if any owner still holds one.
    fn resolve_handle(&self) -> Option<PeerManager<P>> {
        let tx = self.lane.upgrade()?;
        Some(PeerManager {
            tx,
            lane: self.lane.clone(),
            status: self.status_tx.subscribe(),
            identity: Arc::new(self.identity.clone()),
            next_id: self.next_id.clone(),
            destroyed: self.destroy_requested.clone(),
        })
    }

    // Binding

    fn ensure_bound(&mut self) {
        let lane = self.lane.clone();
        let attempt = self.connection.ensure_bound(|epoch| {
            BindCallback::new(
                lane.sink(move |event: LinkEvent<P::Handle>| Command::Link { epoch, event }),
            )
        });

        match attempt {
            BindAttempt::Started | BindAttempt::Underway | BindAttempt::Destroyed => {}
            BindAttempt::Refused => {
                // Same as an immediate death, except that a peer already
                // known dead is not reported again.
                let death = self.connection.mark_died();
                self.handle_peer_died(death);
            }
        }
    }

    fn handle_link_event(&mut self, epoch: u64, event: LinkEvent<P::Handle>) {
        match event {
            LinkEvent::Connected(handle) => {
                let lane = self.lane.clone();
                let outcome = self.connection.on_connected(epoch, handle, |epoch| {
                    DeathRecipient::new(lane.sink(move |()| Command::Died { epoch }))
                });
                match outcome {
                    ConnectOutcome::Connected => {
                        self.observer.on_connected_state_changed(&self.identity, true);
                        self.handle_pending_requests();
                    }
                    ConnectOutcome::Ignored => {}
                    ConnectOutcome::DeathLinkFailed => {
                        let death = self.connection.mark_died();
                        self.handle_peer_died(death);
                    }
                }
            }
            LinkEvent::Failed(message) => {
                if let Some(death) = self.connection.on_link_failed(epoch) {
                    warn!("Bind to {} failed: {}", self.identity, message);
                    self.handle_peer_died(death);
                }
            }
            LinkEvent::Disconnected => {
                if self.connection.on_disconnected(epoch) {
                    self.cancel_scheduled_unbind();
                    self.observer.on_connected_state_changed(&self.identity, false);
                }
            }
        }
    }

    /// Drain the queue in submission order against the new connection.
    fn handle_pending_requests(&mut self) {
        let pending = self.queue.take_all();
        if !pending.is_empty() {
            debug!("Handling {} pending requests for {}", pending.len(), self.identity);
        }
        for request in pending {
            self.handle_pending(request);
        }
    }

    // Death

    fn handle_death_notice(&mut self, epoch: u64) {
        if self.check_if_destroyed() {
            return;
        }
        if let Some(death) = self.connection.on_death_notice(epoch) {
            self.handle_peer_died(death);
        }
    }

    fn handle_peer_died(&mut self, death: DeathOutcome) {
        if self.destroyed {
            return;
        }
        self.cancel_scheduled_unbind();

        if death.was_bound {
            self.observer.on_connected_state_changed(&self.identity, false);
        }
        if self.config.flush_on_death {
            self.flush_queue(AbandonReason::PeerUnavailable);
        }
        if death.first {
            warn!("Peer {} died", self.identity);
            self.observer.on_peer_died(&self.identity);
        }
    }

    // Idle unbind

    fn is_idle(&self) -> bool {
        self.connection.is_bound() && self.queue.is_empty() && self.outstanding.is_empty()
    }

    /// Arm idle unbind when there is nothing left to do, disarm it otherwise.
    fn reconcile_idle_timer(&mut self) {
        if self.destroyed {
            return;
        }
        if !self.is_idle() {
            self.cancel_scheduled_unbind();
            return;
        }
        if self.idle_timer.is_none() {
            self.schedule_unbind();
        }
    }

    fn schedule_unbind(&mut self) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        self.cancel_scheduled_unbind();
        let generation = self.idle_generation;
        debug!("Scheduling unbind of {} in {:?}", self.identity, timeout);
        self.idle_timer = Some(
            self.lane
                .post_after(timeout, Command::IdleUnbind { generation }),
        );
    }

    fn cancel_scheduled_unbind(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
            self.idle_generation += 1;
        }
    }

    fn handle_idle_unbind(&mut self, generation: u64) {
        if self.check_if_destroyed() || generation != self.idle_generation {
            return;
        }
        self.idle_timer = None;
        self.idle_generation += 1;
        if !self.is_idle() {
            return;
        }

        if self.connection.ensure_unbound() == UnbindOutcome::Unbound {
            self.observer.on_connected_state_changed(&self.identity, false);
        }
    }

    // Teardown

    fn handle_destroy(&mut self) {
        if self.check_if_destroyed() {
            return;
        }
        self.cancel_scheduled_unbind();

        self.flush_queue(AbandonReason::Destroyed);
        let outstanding = std::mem::take(&mut self.outstanding);
        for (_, entry) in outstanding {
            self.abandon(Pending::Tracked(entry), AbandonReason::Destroyed);
        }

        if self.connection.destroy() == UnbindOutcome::Unbound {
            self.observer.on_connected_state_changed(&self.identity, false);
        }
        self.destroyed = true;
        self.destroy_requested.store(true, Ordering::Release);
        info!("Destroyed peer manager for {}", self.identity);
    }

    fn flush_queue(&mut self, reason: AbandonReason) {
        for pending in self.queue.take_all() {
            self.abandon(pending, reason);
        }
    }

    fn abandon(&self, pending: Pending<P>, reason: AbandonReason) {
        match pending {
            Pending::Tracked(mut entry) => {
                if entry.ticket.cancel_quietly() {
                    entry.request.on_abandoned(reason);
                }
            }
            Pending::Untracked(_) => {
                warn!("Dropping async request for {}: {}", self.identity, reason);
            }
        }
    }

    fn publish(&self) {
        let snapshot = PeerStatus {
            state: self.connection.state(),
            destroyed: self.destroyed,
            peer_died: self.connection.peer_died(),
            completed_all: self.completed_all,
            queued: self.queue.len(),
            outstanding: self.outstanding.len(),
            bind_attempts: self.connection.epoch(),
            ..self.status_tx.borrow().clone()
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}
