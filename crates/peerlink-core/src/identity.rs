//! Peer identity.

use crate::error::PeerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a remote peer: the process hosting it, the component inside
/// that process, and the user it runs for.
///
/// A manager is created for exactly one identity and never changes it.
/// Rendered as `process/component@user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Process (or address) hosting the peer.
    pub process: String,
    /// Component within the process.
    pub component: String,
    /// User the peer is bound for.
    pub user_id: u32,
}

impl PeerIdentity {
    pub fn new(process: impl Into<String>, component: impl Into<String>, user_id: u32) -> Self {
        Self {
            process: process.into(),
            component: component.into(),
            user_id,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.process, self.component, self.user_id)
    }
}

impl FromStr for PeerIdentity {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| PeerError::Validation {
            field: "peer_identity".to_string(),
            message: format!("{} in {:?} (expected process/component@user)", message, s),
        };

        let (rest, user) = s.rsplit_once('@').ok_or_else(|| invalid("missing '@user'"))?;
        let user_id = user
            .parse::<u32>()
            .map_err(|_| invalid("user is not a number"))?;
        // The process part may itself contain '/', so split on the last one.
        let (process, component) = rest
            .rsplit_once('/')
            .ok_or_else(|| invalid("missing '/component'"))?;

        if process.is_empty() || component.is_empty() {
            return Err(invalid("empty process or component"));
        }

        Ok(Self::new(process, component, user_id))
    }
}
