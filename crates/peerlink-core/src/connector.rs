//! The capability a concrete peer type supplies to the manager.
//!
//! A connector knows how to reach one kind of peer: start a connect attempt,
//! tear a connection down, watch a live handle for death, and turn a raw
//! handle into the typed interface requests run against. Everything it
//! reports back goes through [`BindCallback`] and [`DeathRecipient`], which
//! post typed events onto the manager's lane. Connectors may invoke them from
//! any thread.

use crate::config::BindFlags;
use crate::error::Result;
use crate::identity::PeerIdentity;
use std::fmt;
use std::sync::Arc;

/// Outcome of a connect attempt, as reported by the connector.
#[derive(Debug)]
pub enum LinkEvent<H> {
    /// The peer is reachable through `H`.
    Connected(H),
    /// The attempt failed before producing a handle.
    Failed(String),
    /// The connection dropped but the connector keeps trying and will report
    /// `Connected` again.
    Disconnected,
}

/// Callback handed to [`PeerConnector::connect`] for one connect attempt.
pub struct BindCallback<H> {
    sink: Arc<dyn Fn(LinkEvent<H>) -> bool + Send + Sync>,
}

impl<H> Clone for BindCallback<H> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
        }
    }
}

impl<H: Send + 'static> BindCallback<H> {
    pub(crate) fn new(sink: Arc<dyn Fn(LinkEvent<H>) -> bool + Send + Sync>) -> Self {
        Self { sink }
    }

    /// Report a live connection. Returns false if the manager is gone.
    pub fn connected(&self, handle: H) -> bool {
        (self.sink)(LinkEvent::Connected(handle))
    }

    /// Report that the attempt failed.
    pub fn failed(&self, message: impl Into<String>) -> bool {
        (self.sink)(LinkEvent::Failed(message.into()))
    }

    /// Report a transient loss of the connection.
    pub fn disconnected(&self) -> bool {
        (self.sink)(LinkEvent::Disconnected)
    }
}

impl<H> fmt::Debug for BindCallback<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindCallback").finish_non_exhaustive()
    }
}

/// Death notification registered for one live handle.
#[derive(Clone)]
pub struct DeathRecipient {
    sink: Arc<dyn Fn(()) -> bool + Send + Sync>,
}

impl DeathRecipient {
    pub(crate) fn new(sink: Arc<dyn Fn(()) -> bool + Send + Sync>) -> Self {
        Self { sink }
    }

    /// Report that the peer behind the handle died.
    pub fn died(&self) -> bool {
        (self.sink)(())
    }
}

impl fmt::Debug for DeathRecipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeathRecipient").finish_non_exhaustive()
    }
}

/// Transport capability for one kind of peer.
///
/// All methods are called from the manager's lane and must not block.
pub trait PeerConnector: Send + Sync + 'static {
    /// Raw connection handle produced by a successful connect.
    type Handle: Send + 'static;
    /// Typed interface requests run against.
    type Interface: Send + 'static;

    /// Start connecting to `identity`.
    ///
    /// Returns `false` if the connector will not even attempt the connection;
    /// the callback must then never be invoked. Otherwise the outcome is
    /// reported through `callback`, possibly before this method returns.
    fn connect(
        &self,
        identity: &PeerIdentity,
        flags: BindFlags,
        callback: BindCallback<Self::Handle>,
    ) -> bool;

    /// Release the connection (or cancel the attempt) for `identity`.
    fn disconnect(&self, identity: &PeerIdentity);

    /// Register `recipient` to be told when the peer behind `handle` dies.
    fn link_to_death(&self, handle: &Self::Handle, recipient: DeathRecipient) -> Result<()>;

    /// Remove the registration made by [`PeerConnector::link_to_death`].
    fn unlink_to_death(&self, handle: &Self::Handle);

    /// Build the typed interface for a live handle.
    fn interface(&self, handle: &Self::Handle) -> Self::Interface;
}
