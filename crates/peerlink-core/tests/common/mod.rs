//! Scripted connector and recording helpers shared by the integration tests.

#![allow(dead_code)]

use peerlink::{
    AbandonReason, BindCallback, BindFlags, DeathRecipient, PeerConfig, PeerConnector, PeerError,
    PeerIdentity, PeerManager, PeerObserver, RequestTicket, Result, TrackedRequest,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered log of everything the tests observe.
#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Typed interface of the mock peer: records what ran against which link.
#[derive(Clone)]
pub struct MockPeer {
    pub link: u64,
    events: Events,
}

impl MockPeer {
    pub fn record(&self, event: impl Into<String>) {
        self.events.push(event);
    }
}

#[derive(Default)]
struct MockState {
    connects: Vec<BindFlags>,
    disconnects: usize,
    callback: Option<BindCallback<u64>>,
    recipients: HashMap<u64, DeathRecipient>,
    next_link: u64,
    refuse: bool,
    fail_link: bool,
}

/// Connector driven by the test: nothing happens until the test says so.
#[derive(Default)]
pub struct MockConnector {
    state: Mutex<MockState>,
    events: Events,
}

impl MockConnector {
    pub fn new(events: Events) -> Self {
        Self {
            state: Mutex::default(),
            events,
        }
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects.len()
    }

    pub fn last_flags(&self) -> Option<BindFlags> {
        self.state.lock().unwrap().connects.last().copied()
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    /// Make `connect` return false.
    pub fn set_refuse(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    /// Make `link_to_death` fail.
    pub fn set_fail_link(&self, fail: bool) {
        self.state.lock().unwrap().fail_link = fail;
    }

    /// Deliver a successful connect for the latest attempt. Returns the link id.
    pub fn complete_bind(&self) -> u64 {
        let (callback, link) = {
            let mut state = self.state.lock().unwrap();
            state.next_link += 1;
            let callback = state.callback.clone().expect("no connect attempt");
            (callback, state.next_link)
        };
        callback.connected(link);
        link
    }

    /// Deliver a failed connect for the latest attempt.
    pub fn fail_bind(&self) {
        let callback = self.state.lock().unwrap().callback.take().expect("no connect attempt");
        callback.failed("scripted failure");
    }

    /// Deliver a transient disconnect for the latest attempt.
    pub fn drop_link(&self) {
        let callback = self.state.lock().unwrap().callback.clone().expect("no connect attempt");
        callback.disconnected();
    }

    /// Fire the death notification of `link`. Returns false if none is registered.
    pub fn kill(&self, link: u64) -> bool {
        let recipient = self.state.lock().unwrap().recipients.remove(&link);
        match recipient {
            Some(recipient) => {
                recipient.died();
                true
            }
            None => false,
        }
    }

    /// Keep a copy of the death notification so a test can fire it twice.
    pub fn recipient(&self, link: u64) -> Option<DeathRecipient> {
        self.state.lock().unwrap().recipients.get(&link).cloned()
    }
}

impl PeerConnector for MockConnector {
    type Handle = u64;
    type Interface = MockPeer;

    fn connect(&self, _: &PeerIdentity, flags: BindFlags, callback: BindCallback<u64>) -> bool {
        let mut state = self.state.lock().unwrap();
        state.connects.push(flags);
        if state.refuse {
            return false;
        }
        state.callback = Some(callback);
        true
    }

    fn disconnect(&self, _: &PeerIdentity) {
        self.state.lock().unwrap().disconnects += 1;
    }

    fn link_to_death(&self, handle: &u64, recipient: DeathRecipient) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_link {
            return Err(PeerError::PeerUnavailable {
                identity: format!("link {}", handle),
            });
        }
        state.recipients.insert(*handle, recipient);
        Ok(())
    }

    fn unlink_to_death(&self, handle: &u64) {
        self.state.lock().unwrap().recipients.remove(handle);
    }

    fn interface(&self, handle: &u64) -> MockPeer {
        MockPeer {
            link: *handle,
            events: self.events.clone(),
        }
    }
}

/// Observer that logs `connected:<bool>` and `died`.
pub struct RecordingObserver(pub Events);

impl PeerObserver for RecordingObserver {
    fn on_connected_state_changed(&self, _: &PeerIdentity, connected: bool) {
        self.0.push(format!("connected:{}", connected));
    }

    fn on_peer_died(&self, _: &PeerIdentity) {
        self.0.push("died");
    }
}

/// How a [`Recorded`] request answers.
#[derive(Clone, Copy)]
pub enum Reply {
    /// Complete the ticket inside `run`.
    Immediate,
    /// Leave the ticket armed; the test completes it through `tickets`.
    Never,
}

/// Tracked request that logs `run:<name>`, `timeout:<name>` and
/// `abandoned:<name>:<reason>`.
pub struct Recorded {
    pub name: &'static str,
    pub reply: Reply,
    pub is_final: bool,
    pub timeout: Option<Duration>,
    pub events: Events,
    pub tickets: Arc<Mutex<Vec<RequestTicket>>>,
}

impl Recorded {
    pub fn new(name: &'static str, events: &Events) -> Self {
        Self {
            name,
            reply: Reply::Immediate,
            is_final: false,
            timeout: None,
            events: events.clone(),
            tickets: Arc::default(),
        }
    }

    pub fn pending(mut self) -> Self {
        self.reply = Reply::Never;
        self
    }

    pub fn final_request(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl TrackedRequest<MockConnector> for Recorded {
    fn run(&mut self, peer: &MockPeer, ticket: RequestTicket) {
        peer.record(format!("run:{}", self.name));
        match self.reply {
            Reply::Immediate => {
                ticket.complete();
            }
            Reply::Never => self.tickets.lock().unwrap().push(ticket),
        }
    }

    fn on_timeout(&mut self, _: &PeerManager<MockConnector>) {
        self.events.push(format!("timeout:{}", self.name));
    }

    fn on_abandoned(&mut self, reason: AbandonReason) {
        self.events.push(format!("abandoned:{}:{}", self.name, reason));
    }

    fn is_final(&self) -> bool {
        self.is_final
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn label(&self) -> &str {
        self.name
    }
}

pub fn identity() -> PeerIdentity {
    PeerIdentity::new("com.example.peer", "EchoService", 0)
}

/// Manager over a fresh mock connector, logging into one shared event list.
pub fn mock_manager(
    config: PeerConfig,
) -> (PeerManager<MockConnector>, Arc<MockConnector>, Events) {
    let events = Events::default();
    let connector = Arc::new(MockConnector::new(events.clone()));
    let manager = PeerManager::new(
        identity(),
        connector.clone(),
        config,
        Arc::new(RecordingObserver(events.clone())),
    )
    .unwrap();
    (manager, connector, events)
}
