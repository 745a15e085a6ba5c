//! Observer hooks the owner of a manager can register.

use crate::identity::PeerIdentity;

/// Lifecycle notifications from a peer manager, delivered on its lane.
///
/// Implementations must not block; hand heavy work off to another task.
pub trait PeerObserver: Send + Sync + 'static {
    /// The connection became live (`true`) or was released or lost (`false`).
    fn on_connected_state_changed(&self, _identity: &PeerIdentity, _connected: bool) {}

    /// The peer died or could not be bound. Fired once per death.
    fn on_peer_died(&self, _identity: &PeerIdentity) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PeerObserver for NoopObserver {}
