//! Centralized configuration for peerlink.
//!
//! Constant tables for defaults and IPC limits, plus the runtime
//! [`PeerConfig`] each manager is constructed with.

use crate::error::{PeerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::path::Path;
use std::time::Duration;

/// Default lifecycle timings.
pub struct PeerDefaults;

impl PeerDefaults {
    /// How long after the last unit of work the connection is released.
    pub const IDLE_UNBIND_TIMEOUT: Duration = Duration::from_secs(5);
    /// How long a tracked request may wait for its reply.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Limits for the bundled loopback IPC transport.
pub struct IpcConfig;

impl IpcConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const BIND_HOST: &'static str = "127.0.0.1";
}

/// Flags passed to the connector on every connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BindFlags(u32);

impl BindFlags {
    /// Start the peer if it is not running.
    pub const AUTO_CREATE: BindFlags = BindFlags(1 << 0);
    /// Schedule the peer with elevated priority while bound.
    pub const FOREGROUND: BindFlags = BindFlags(1 << 1);
    /// Allow binding a peer that is not fully installed yet.
    pub const ALLOW_INSTANT: BindFlags = BindFlags(1 << 2);

    pub const fn empty() -> Self {
        BindFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BindFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BindFlags {
    type Output = BindFlags;

    fn bitor(self, rhs: BindFlags) -> BindFlags {
        BindFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for BindFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (BindFlags::AUTO_CREATE, "AUTO_CREATE"),
            (BindFlags::FOREGROUND, "FOREGROUND"),
            (BindFlags::ALLOW_INSTANT, "ALLOW_INSTANT"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();

        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// What happens when a tracked request arrives while another one is still
/// unresolved under [`PendingPolicy::Single`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersedePolicy {
    /// Cancel the unresolved request and keep the new one.
    #[default]
    Supersede,
    /// Keep the unresolved request and cancel the new one.
    Reject,
}

/// How many tracked requests may be unresolved at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// At most one tracked request, queued or in flight.
    Single(SupersedePolicy),
    /// Any number of tracked requests, each resolved independently.
    Multiple,
}

impl Default for PendingPolicy {
    fn default() -> Self {
        PendingPolicy::Multiple
    }
}

/// Runtime configuration of one peer manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Release the connection after this long without work.
    /// `None` keeps it bound until destroy or death.
    #[serde(rename = "idle_timeout_ms", with = "opt_duration_ms")]
    pub idle_timeout: Option<Duration>,
    /// Default timeout for tracked requests.
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,
    /// Pass [`BindFlags::ALLOW_INSTANT`] on connect.
    pub allow_instant: bool,
    pub pending_policy: PendingPolicy,
    /// Abandon still-queued requests when the peer dies or cannot be bound.
    pub flush_on_death: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(PeerDefaults::IDLE_UNBIND_TIMEOUT),
            request_timeout: PeerDefaults::REQUEST_TIMEOUT,
            allow_instant: false,
            pending_policy: PendingPolicy::Multiple,
            flush_on_death: true,
        }
    }
}

impl PeerConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle unbind timeout (`None` disables idle unbind).
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Allow binding peers that are not fully installed.
    pub fn with_allow_instant(mut self, allow: bool) -> Self {
        self.allow_instant = allow;
        self
    }

    /// Set the pending request policy.
    pub fn with_pending_policy(mut self, policy: PendingPolicy) -> Self {
        self.pending_policy = policy;
        self
    }

    /// Choose whether queued requests are abandoned on death.
    pub fn with_flush_on_death(mut self, flush: bool) -> Self {
        self.flush_on_death = flush;
        self
    }

    /// Flags for a connect attempt.
    pub fn bind_flags(&self) -> BindFlags {
        let flags = BindFlags::AUTO_CREATE | BindFlags::FOREGROUND;
        if self.allow_instant {
            flags | BindFlags::ALLOW_INSTANT
        } else {
            flags
        }
    }

    /// Reject configurations the manager cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(PeerError::config("request_timeout must be greater than zero"));
        }
        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PeerError::config(
                "idle_timeout must be greater than zero (use null to disable idle unbind)",
            ));
        }
        Ok(())
    }

    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PeerConfig = serde_json::from_str(json).map_err(|e| PeerError::Json {
            message: format!("Failed to parse peer config: {}", e),
            source: Some(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| PeerError::Io {
            message: format!("Failed to read {}: {}", path.display(), e),
            source: Some(e),
        })?;
        Self::from_json_str(&contents)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
