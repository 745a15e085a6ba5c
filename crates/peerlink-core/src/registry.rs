//! One manager per peer identity.
//!
//! Owners that talk to many peers of the same kind keep a registry instead of
//! individual managers. A manager is created on first use and cached; when its
//! peer dies it is evicted and destroyed so the next lookup starts from a
//! fresh manager.

use crate::config::PeerConfig;
use crate::connector::PeerConnector;
use crate::error::Result;
use crate::identity::PeerIdentity;
use crate::manager::PeerManager;
use crate::observer::{NoopObserver, PeerObserver};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info};

type ManagerMap<P> = RwLock<HashMap<PeerIdentity, Registered<P>>>;

/// A cached manager and the instance number it was registered under.
struct Registered<P: PeerConnector> {
    instance: u64,
    manager: PeerManager<P>,
}
type ConnectorFactory<P> = dyn Fn(&PeerIdentity) -> Arc<P> + Send + Sync;

/// Lazily created, cached peer managers keyed by identity.
pub struct PeerRegistry<P: PeerConnector> {
    factory: Box<ConnectorFactory<P>>,
    config: PeerConfig,
    observer: Arc<dyn PeerObserver>,
    managers: Arc<ManagerMap<P>>,
    next_instance: AtomicU64,
}

impl<P: PeerConnector> PeerRegistry<P> {
    /// Create a registry whose managers get their connector from `factory`.
    pub fn new<F>(factory: F, config: PeerConfig) -> Self
    where
        F: Fn(&PeerIdentity) -> Arc<P> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            config,
            observer: Arc::new(NoopObserver),
            managers: Arc::new(RwLock::new(HashMap::new())),
            next_instance: AtomicU64::new(1),
        }
    }

    /// Create a registry whose managers all share one connector.
    pub fn with_shared_connector(connector: Arc<P>, config: PeerConfig) -> Self {
        Self::new(move |_| connector.clone(), config)
    }

    /// Forward lifecycle notifications of every manager to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn PeerObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Get the cached manager for `identity`, creating it if needed.
    pub fn get_or_create(&self, identity: &PeerIdentity) -> Result<PeerManager<P>> {
        // Check cache first
        {
            let managers = self.managers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = managers.get(identity) {
                if !entry.manager.is_destroyed() {
                    return Ok(entry.manager.clone());
                }
            }
        }

        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = managers.get(identity) {
            if !entry.manager.is_destroyed() {
                return Ok(entry.manager.clone());
            }
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let observer = Arc::new(EvictOnDeath {
            inner: self.observer.clone(),
            managers: Arc::downgrade(&self.managers),
            instance,
        });
        let manager = PeerManager::new(
            identity.clone(),
            (self.factory)(identity),
            self.config.clone(),
            observer,
        )?;
        debug!("Registered peer manager #{} for {}", instance, identity);
        let replaced = managers.insert(
            identity.clone(),
            Registered {
                instance,
                manager: manager.clone(),
            },
        );
        if let Some(stale) = replaced {
            stale.manager.destroy();
        }
        Ok(manager)
    }

    /// Cached manager for `identity`, if any.
    pub fn get(&self, identity: &PeerIdentity) -> Option<PeerManager<P>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .map(|entry| entry.manager.clone())
    }

    /// Evict and destroy the manager for `identity`. Returns whether one existed.
    pub fn remove(&self, identity: &PeerIdentity) -> bool {
        let removed = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);
        match removed {
            Some(entry) => {
                entry.manager.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroy every cached manager.
    pub fn destroy_all(&self) {
        let drained: Vec<_> = self
            .managers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            info!("Destroying {} peer managers", drained.len());
        }
        for (_, entry) in drained {
            entry.manager.destroy();
        }
    }

    pub fn identities(&self) -> Vec<PeerIdentity> {
        let mut identities: Vec<_> = self
            .managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: PeerConnector> Drop for PeerRegistry<P> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Observer installed on registry managers.
///
/// Holds the map weakly: the map owns the managers, whose lanes own this
/// observer. Only evicts the entry registered as `instance`.
struct EvictOnDeath<P: PeerConnector> {
    inner: Arc<dyn PeerObserver>,
    managers: Weak<ManagerMap<P>>,
    instance: u64,
}

impl<P: PeerConnector> PeerObserver for EvictOnDeath<P> {
    fn on_connected_state_changed(&self, identity: &PeerIdentity, connected: bool) {
        self.inner.on_connected_state_changed(identity, connected);
    }

    fn on_peer_died(&self, identity: &PeerIdentity) {
        self.inner.on_peer_died(identity);

        let Some(managers) = self.managers.upgrade() else {
            return;
        };
        let evicted = {
            let mut managers = managers.write().unwrap_or_else(PoisonError::into_inner);
            let current = managers
                .get(identity)
                .is_some_and(|entry| entry.instance == self.instance);
            if current {
                managers.remove(identity)
            } else {
                None
            }
        };
        match evicted {
            Some(entry) => {
                info!("Evicting peer manager for {} after death", identity);
                entry.manager.destroy();
            }
            None => debug!(
                "Peer manager #{} for {} died after it was replaced",
                self.instance, identity
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::NullConnector;

    fn registry() -> PeerRegistry<NullConnector> {
        PeerRegistry::with_shared_connector(Arc::new(NullConnector), PeerConfig::default())
    }

    #[tokio::test]
    async fn test_get_or_create_caches() {
        let registry = registry();
        let id = PeerIdentity::new("proc", "Comp", 0);

        let first = registry.get_or_create(&id).unwrap();
        let second = registry.get_or_create(&id).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(first.identity(), second.identity());

        registry.get_or_create(&PeerIdentity::new("proc", "Comp", 10)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.identities()[1].user_id, 10);
    }

    #[tokio::test]
    async fn test_remove_destroys() {
        let registry = registry();
        let id = PeerIdentity::new("proc", "Comp", 0);
        let manager = registry.get_or_create(&id).unwrap();

        assert!(registry.remove(&id));
        assert!(!registry.remove(&id));
        manager.barrier().await;
        assert!(manager.is_destroyed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_destroyed_manager_is_replaced() {
        let registry = registry();
        let id = PeerIdentity::new("proc", "Comp", 0);
        let manager = registry.get_or_create(&id).unwrap();
        manager.destroy();
        manager.barrier().await;

        let fresh = registry.get_or_create(&id).unwrap();
        assert!(!fresh.is_destroyed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_being_destroyed_is_replaced_at_once() {
        let registry = registry();
        let id = PeerIdentity::new("proc", "Comp", 0);
        let manager = registry.get_or_create(&id).unwrap();
        manager.destroy();

        let fresh = registry.get_or_create(&id).unwrap();
        assert!(!fresh.is_destroyed());
        assert_eq!(registry.len(), 1);

        fresh.submit_untracked(|_| Ok(()));
        fresh.barrier().await;
        manager.barrier().await;
        assert!(manager.status().destroyed);
        assert_eq!(fresh.status().bind_attempts, 1);
        assert_eq!(registry.get(&id).unwrap().status().bind_attempts, 1);
    }

    #[tokio::test]
    async fn test_destroy_all() {
        let registry = registry();
        let a = registry.get_or_create(&PeerIdentity::new("a", "A", 0)).unwrap();
        let b = registry.get_or_create(&PeerIdentity::new("b", "B", 0)).unwrap();

        registry.destroy_all();
        a.barrier().await;
        b.barrier().await;
        assert!(a.is_destroyed() && b.is_destroyed());
        assert!(registry.is_empty());
    }
}
