//! Connection state machine.
//!
//! ```text
//!          request                connected
//!   Idle ───────────▶ Binding ─────────────────▶ Bound
//!    ▲                 │  ▲                       │
//!    │   failed/death  │  └──── disconnected ─────┤
//!    ├─────────────────┘                          │
//!    └──────────── idle unbind / death ───────────┘
//!
//!   any ── destroy ──▶ Destroyed
//! ```
//!
//! The connection exclusively owns the live handle and its interface. Each
//! connect attempt gets a new epoch; events tagged with an older epoch are
//! stale and ignored.

use crate::config::BindFlags;
use crate::connector::{BindCallback, DeathRecipient, PeerConnector};
use crate::identity::PeerIdentity;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resting states of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Binding,
    Bound,
    Destroyed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Binding => write!(f, "BINDING"),
            ConnectionState::Bound => write!(f, "BOUND"),
            ConnectionState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// Result of asking for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindAttempt {
    /// Already bound or binding.
    Underway,
    /// A new connect attempt was issued.
    Started,
    /// The connector refused to even attempt it.
    Refused,
    Destroyed,
}

/// Result of a `connected` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    Connected,
    /// Stale or unexpected callback, nothing changed.
    Ignored,
    /// The handle could not be watched for death; the caller must run the
    /// death path.
    DeathLinkFailed,
}

/// Result of releasing the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnbindOutcome {
    NotBound,
    /// A pending connect attempt was abandoned.
    CancelledBind,
    /// A live connection was released.
    Unbound,
}

/// What a death did to the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeathOutcome {
    pub was_bound: bool,
    /// First death since the last successful connect.
    pub first: bool,
}

struct LiveLink<P: PeerConnector> {
    handle: P::Handle,
    interface: P::Interface,
}

pub(crate) struct Connection<P: PeerConnector> {
    connector: Arc<P>,
    identity: PeerIdentity,
    flags: BindFlags,
    state: ConnectionState,
    epoch: u64,
    link: Option<LiveLink<P>>,
    peer_died: bool,
}

impl<P: PeerConnector> Connection<P> {
    pub fn new(connector: Arc<P>, identity: PeerIdentity, flags: BindFlags) -> Self {
        Self {
            connector,
            identity,
            flags,
            state: ConnectionState::Idle,
            epoch: 0,
            link: None,
            peer_died: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_bound(&self) -> bool {
        self.link.is_some()
    }

    pub fn peer_died(&self) -> bool {
        self.peer_died
    }

    pub fn interface(&self) -> Option<&P::Interface> {
        self.link.as_ref().map(|link| &link.interface)
    }

    /// Start a connect attempt unless one is underway.
    pub fn ensure_bound<F>(&mut self, callback: F) -> BindAttempt
    where
        F: FnOnce(u64) -> BindCallback<P::Handle>,
    {
        match self.state {
            ConnectionState::Bound | ConnectionState::Binding => return BindAttempt::Underway,
            ConnectionState::Destroyed => return BindAttempt::Destroyed,
            ConnectionState::Idle => {}
        }

        self.epoch += 1;
        self.state = ConnectionState::Binding;
        debug!(
            "Binding to {} (attempt {}, flags {})",
            self.identity, self.epoch, self.flags
        );

        let will_bind = self
            .connector
            .connect(&self.identity, self.flags, callback(self.epoch));

        if !will_bind {
            warn!(
                "Could not bind to {} using flags {}",
                self.identity, self.flags
            );
            self.state = ConnectionState::Idle;
            return BindAttempt::Refused;
        }
        BindAttempt::Started
    }

    /// Apply a `connected` callback for `epoch`.
    pub fn on_connected<F>(&mut self, epoch: u64, handle: P::Handle, recipient: F) -> ConnectOutcome
    where
        F: FnOnce(u64) -> DeathRecipient,
    {
        if self.state != ConnectionState::Binding || epoch != self.epoch {
            // Nothing is waiting for this handle; it is dropped here.
            error!(
                "Connect callback for {} (attempt {}) dispatched in state {} (current attempt {})",
                self.identity, epoch, self.state, self.epoch
            );
            if matches!(self.state, ConnectionState::Idle | ConnectionState::Destroyed) {
                self.connector.disconnect(&self.identity);
            }
            return ConnectOutcome::Ignored;
        }

        let interface = self.connector.interface(&handle);
        if let Err(e) = self.connector.link_to_death(&handle, recipient(epoch)) {
            warn!("Failed to watch {} for death: {}", self.identity, e);
            self.state = ConnectionState::Idle;
            return ConnectOutcome::DeathLinkFailed;
        }

        self.link = Some(LiveLink { handle, interface });
        self.state = ConnectionState::Bound;
        self.peer_died = false;
        info!("Connected to {} (attempt {})", self.identity, epoch);
        ConnectOutcome::Connected
    }

    /// Apply a `failed` callback. Returns the death to handle, if any.
    pub fn on_link_failed(&mut self, epoch: u64) -> Option<DeathOutcome> {
        if self.state != ConnectionState::Binding || epoch != self.epoch {
            debug!(
                "Ignoring stale bind failure for {} (attempt {})",
                self.identity, epoch
            );
            return None;
        }
        Some(self.mark_died())
    }

    /// Apply a death notification. Returns the death to handle, if any.
    pub fn on_death_notice(&mut self, epoch: u64) -> Option<DeathOutcome> {
        if self.state != ConnectionState::Bound || epoch != self.epoch {
            debug!(
                "Ignoring stale death notification for {} (attempt {})",
                self.identity, epoch
            );
            return None;
        }
        Some(self.mark_died())
    }

    /// Apply a transient `disconnected` callback. Returns true if a live
    /// connection was lost.
    pub fn on_disconnected(&mut self, epoch: u64) -> bool {
        if self.state != ConnectionState::Bound || epoch != self.epoch {
            debug!(
                "Ignoring disconnect for {} (attempt {})",
                self.identity, epoch
            );
            return false;
        }
        if let Some(link) = self.link.take() {
            self.connector.unlink_to_death(&link.handle);
        }
        self.state = ConnectionState::Binding;
        info!("Lost connection to {}, waiting for reconnect", self.identity);
        true
    }

    /// Death path: drop the handle without a clean disconnect.
    ///
    /// Unlinks the death notification before dropping the handle so it
    /// cannot fire a second time.
    pub fn mark_died(&mut self) -> DeathOutcome {
        let was_bound = match self.link.take() {
            Some(link) => {
                self.connector.unlink_to_death(&link.handle);
                true
            }
            None => false,
        };
        if self.state != ConnectionState::Destroyed {
            self.state = ConnectionState::Idle;
        }
        let first = !self.peer_died;
        self.peer_died = true;
        DeathOutcome { was_bound, first }
    }

    /// Release the connection or abandon the pending attempt.
    pub fn ensure_unbound(&mut self) -> UnbindOutcome {
        let outcome = match self.state {
            ConnectionState::Idle | ConnectionState::Destroyed => return UnbindOutcome::NotBound,
            ConnectionState::Binding => UnbindOutcome::CancelledBind,
            ConnectionState::Bound => UnbindOutcome::Unbound,
        };

        if let Some(link) = self.link.take() {
            self.connector.unlink_to_death(&link.handle);
        }
        self.state = ConnectionState::Idle;
        self.connector.disconnect(&self.identity);
        info!("Unbound from {}", self.identity);
        outcome
    }

    /// Terminal transition. Idempotent.
    pub fn destroy(&mut self) -> UnbindOutcome {
        let outcome = self.ensure_unbound();
        self.state = ConnectionState::Destroyed;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LinkEvent;
    use crate::error::{PeerError, Result};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        refuse: bool,
        fail_link: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl PeerConnector for Recorder {
        type Handle = u32;
        type Interface = String;

        fn connect(&self, _: &PeerIdentity, flags: BindFlags, _: BindCallback<u32>) -> bool {
            self.record(format!("connect {}", flags));
            !self.refuse
        }

        fn disconnect(&self, _: &PeerIdentity) {
            self.record("disconnect".into());
        }

        fn link_to_death(&self, handle: &u32, _: DeathRecipient) -> Result<()> {
            if self.fail_link {
                return Err(PeerError::Other("gone".into()));
            }
            self.record(format!("link {}", handle));
            Ok(())
        }

        fn unlink_to_death(&self, handle: &u32) {
            self.record(format!("unlink {}", handle));
        }

        fn interface(&self, handle: &u32) -> String {
            format!("iface-{}", handle)
        }
    }

    fn callback(_: u64) -> BindCallback<u32> {
        BindCallback::new(Arc::new(|_: LinkEvent<u32>| true))
    }

    fn recipient(_: u64) -> DeathRecipient {
        DeathRecipient::new(Arc::new(|_| true))
    }

    fn connection(recorder: Recorder) -> (Connection<Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(recorder);
        let conn = Connection::new(
            recorder.clone(),
            PeerIdentity::new("proc", "comp", 0),
            BindFlags::AUTO_CREATE | BindFlags::FOREGROUND,
        );
        (conn, recorder)
    }

    #[test]
    fn test_bind_then_connect() {
        let (mut conn, recorder) = connection(Recorder::default());
        assert_eq!(conn.state(), ConnectionState::Idle);

        assert_eq!(conn.ensure_bound(callback), BindAttempt::Started);
        assert_eq!(conn.state(), ConnectionState::Binding);
        assert_eq!(conn.ensure_bound(callback), BindAttempt::Underway);

        assert_eq!(conn.on_connected(1, 7, recipient), ConnectOutcome::Connected);
        assert_eq!(conn.state(), ConnectionState::Bound);
        assert_eq!(conn.interface().map(String::as_str), Some("iface-7"));

        assert_eq!(
            recorder.calls(),
            vec!["connect AUTO_CREATE|FOREGROUND", "link 7"]
        );
    }

    #[test]
    fn test_refused_bind_returns_to_idle() {
        let (mut conn, _) = connection(Recorder {
            refuse: true,
            ..Default::default()
        });
        assert_eq!(conn.ensure_bound(callback), BindAttempt::Refused);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_stale_connect_is_ignored() {
        let (mut conn, _) = connection(Recorder::default());
        conn.ensure_bound(callback);
        conn.ensure_unbound();

        assert_eq!(conn.on_connected(1, 7, recipient), ConnectOutcome::Ignored);
        assert!(!conn.is_bound());

        conn.ensure_bound(callback);
        assert_eq!(conn.on_connected(1, 7, recipient), ConnectOutcome::Ignored);
        assert_eq!(conn.on_connected(2, 8, recipient), ConnectOutcome::Connected);
    }

    #[test]
    fn test_death_link_failure() {
        let (mut conn, _) = connection(Recorder {
            fail_link: true,
            ..Default::default()
        });
        conn.ensure_bound(callback);
        assert_eq!(
            conn.on_connected(1, 7, recipient),
            ConnectOutcome::DeathLinkFailed
        );
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.is_bound());
    }

    #[test]
    fn test_death_once_per_connection() {
        let (mut conn, recorder) = connection(Recorder::default());
        conn.ensure_bound(callback);
        conn.on_connected(1, 7, recipient);

        let death = conn.on_death_notice(1).unwrap();
        assert_eq!(
            death,
            DeathOutcome {
                was_bound: true,
                first: true
            }
        );
        assert!(conn.peer_died());
        assert!(conn.on_death_notice(1).is_none());

        // A failing reconnect does not count as a second death.
        conn.ensure_bound(callback);
        let death = conn.on_link_failed(2).unwrap();
        assert!(!death.first);
        assert!(!death.was_bound);

        // Death never disconnects cleanly.
        assert!(!recorder.calls().contains(&"disconnect".to_string()));
        assert!(recorder.calls().contains(&"unlink 7".to_string()));
    }

    #[test]
    fn test_reconnect_resets_peer_died() {
        let (mut conn, _) = connection(Recorder::default());
        conn.ensure_bound(callback);
        conn.on_link_failed(1);
        assert!(conn.peer_died());

        conn.ensure_bound(callback);
        conn.on_connected(2, 9, recipient);
        assert!(!conn.peer_died());
    }

    #[test]
    fn test_transient_disconnect() {
        let (mut conn, _) = connection(Recorder::default());
        conn.ensure_bound(callback);
        conn.on_connected(1, 7, recipient);

        assert!(conn.on_disconnected(1));
        assert_eq!(conn.state(), ConnectionState::Binding);
        assert!(!conn.is_bound());
        assert_eq!(conn.on_connected(1, 8, recipient), ConnectOutcome::Connected);
    }

    #[test]
    fn test_unbind_and_destroy() {
        let (mut conn, recorder) = connection(Recorder::default());
        assert_eq!(conn.ensure_unbound(), UnbindOutcome::NotBound);

        conn.ensure_bound(callback);
        assert_eq!(conn.ensure_unbound(), UnbindOutcome::CancelledBind);

        conn.ensure_bound(callback);
        conn.on_connected(2, 7, recipient);
        assert_eq!(conn.destroy(), UnbindOutcome::Unbound);
        assert_eq!(conn.state(), ConnectionState::Destroyed);
        assert_eq!(conn.destroy(), UnbindOutcome::NotBound);
        assert_eq!(conn.ensure_bound(callback), BindAttempt::Destroyed);

        let disconnects = recorder
            .calls()
            .iter()
            .filter(|c| *c == "disconnect")
            .count();
        assert_eq!(disconnects, 2);
    }
}
