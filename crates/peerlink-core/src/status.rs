//! Point-in-time snapshot of a manager, published after every lane step.

use crate::config::PeerConfig;
use crate::connection::ConnectionState;
use crate::identity::PeerIdentity;
use serde::Serialize;
use std::fmt;

/// Observable state of a peer manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
    pub destroyed: bool,
    pub peer_died: bool,
    /// A final request ran; further submissions are dropped.
    pub completed_all: bool,
    /// Requests waiting for the connection.
    pub queued: usize,
    /// Tracked requests that ran and await their reply.
    pub outstanding: usize,
    /// Connect attempts made so far.
    pub bind_attempts: u64,
    pub idle_timeout_ms: Option<u64>,
    pub request_timeout_ms: u64,
    pub allow_instant: bool,
}

impl PeerStatus {
    pub(crate) fn initial(identity: PeerIdentity, config: &PeerConfig) -> Self {
        Self {
            identity,
            state: ConnectionState::Idle,
            destroyed: false,
            peer_died: false,
            completed_all: false,
            queued: 0,
            outstanding: 0,
            bind_attempts: 0,
            idle_timeout_ms: config.idle_timeout.map(|d| d.as_millis() as u64),
            request_timeout_ms: config.request_timeout.as_millis() as u64,
            allow_instant: config.allow_instant,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state == ConnectionState::Bound
    }

    /// Bound with nothing queued or outstanding.
    pub fn is_idle(&self) -> bool {
        self.is_bound() && self.queued == 0 && self.outstanding == 0
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tab = "  ";
        writeln!(f, "peer:")?;
        writeln!(f, "{}userId={}", tab, self.identity.user_id)?;
        writeln!(
            f,
            "{}component={}/{}",
            tab, self.identity.process, self.identity.component
        )?;
        writeln!(f, "{}state={}", tab, self.state)?;
        writeln!(f, "{}destroyed={}", tab, self.destroyed)?;
        writeln!(f, "{}bound={}", tab, self.is_bound())?;
        writeln!(f, "{}peerDied={}", tab, self.peer_died)?;
        writeln!(f, "{}completedAll={}", tab, self.completed_all)?;
        writeln!(f, "{}queued={}", tab, self.queued)?;
        writeln!(f, "{}outstanding={}", tab, self.outstanding)?;
        writeln!(f, "{}bindAttempts={}", tab, self.bind_attempts)?;
        writeln!(f, "allowInstant={}", self.allow_instant)?;
        match self.idle_timeout_ms {
            Some(ms) => writeln!(f, "idleTimeout={}ms", ms)?,
            None => writeln!(f, "idleTimeout=never")?,
        }
        writeln!(f, "requestTimeout={}ms", self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status() {
        let status = PeerStatus::initial(PeerIdentity::new("p", "c", 3), &PeerConfig::default());
        assert_eq!(status.state, ConnectionState::Idle);
        assert!(!status.is_bound());
        assert!(!status.is_idle());
        assert_eq!(status.idle_timeout_ms, Some(5000));
    }

    #[test]
    fn test_dump_format() {
        let config = PeerConfig::default().with_idle_timeout(None);
        let dump = PeerStatus::initial(PeerIdentity::new("p", "c", 3), &config).to_string();

        assert!(dump.starts_with("peer:\n"));
        assert!(dump.contains("  userId=3\n"));
        assert!(dump.contains("  component=p/c\n"));
        assert!(dump.contains("  state=IDLE\n"));
        assert!(dump.contains("idleTimeout=never\n"));
        assert!(dump.contains("requestTimeout=5000ms"));
    }

    #[test]
    fn test_serializes_as_json() {
        let status = PeerStatus::initial(PeerIdentity::new("p", "c", 3), &PeerConfig::default());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["identity"]["component"], "c");
    }
}
