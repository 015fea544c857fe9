// Cross-tab change notifications layered over a shared storage backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::backend::{MemoryStorage, Result, StorageBackend};

const BUS_CAPACITY: usize = 256;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// A persisted key changed. `key == None` means "changes were missed,
/// resync everything".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: Option<String>,
    pub origin: u64,
}

impl StorageChange {
    pub fn affects(&self, key: &str) -> bool {
        self.key.as_deref().map_or(true, |k| k == key)
    }
}

/// Handle to a storage backend as seen from one "tab". Clones share the same
/// origin; `tab()` makes a sibling with its own origin on the same backend.
#[derive(Clone)]
pub struct SharedStorage {
    backend: Arc<dyn StorageBackend>,
    bus: broadcast::Sender<StorageChange>,
    origin: u64,
}

impl SharedStorage {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<dyn StorageBackend>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            backend,
            bus,
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    pub fn tab(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            bus: self.bus.clone(),
            origin: NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.backend.get(key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.backend.set(key, value)?;
        self.publish(key);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(key)?;
        self.publish(key);
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys()
    }

    /// Changes made through other tabs. Drop the subscription to unsubscribe.
    pub fn subscribe(&self) -> StorageSubscription {
        StorageSubscription {
            rx: self.bus.subscribe(),
            origin: self.origin,
        }
    }

    fn publish(&self, key: &str) {
        // No receivers is fine: nobody else is watching.
        let _ = self.bus.send(StorageChange {
            key: Some(key.to_string()),
            origin: self.origin,
        });
    }
}

pub struct StorageSubscription {
    rx: broadcast::Receiver<StorageChange>,
    origin: u64,
}

impl StorageSubscription {
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.origin == self.origin => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("storage subscriber lagged, {} changes missed", missed);
                    return Some(self.resync());
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of `recv`.
    pub fn try_recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) if change.origin == self.origin => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    warn!("storage subscriber lagged, {} changes missed", missed);
                    return Some(self.resync());
                }
                Err(_) => return None,
            }
        }
    }

    fn resync(&self) -> StorageChange {
        debug!("requesting full resync for origin {}", self.origin);
        StorageChange {
            key: None,
            origin: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_skips_own_origin() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        let mut sub_a = tab_a.subscribe();
        let mut sub_b = tab_b.subscribe();

        tab_a.set("cart:x", "{}").unwrap();

        assert_eq!(sub_a.try_recv(), None);
        let change = sub_b.try_recv().unwrap();
        assert_eq!(change.key.as_deref(), Some("cart:x"));
        assert_eq!(change.origin, tab_a.origin());
        assert!(change.affects("cart:x"));
        assert!(!change.affects("cartstatus"));
    }

    #[test]
    fn test_tabs_share_backend() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        assert_ne!(tab_a.origin(), tab_b.origin());

        tab_b.set("k", "v").unwrap();
        assert_eq!(tab_a.get("k").unwrap().as_deref(), Some("v"));

        tab_a.remove("k").unwrap();
        assert_eq!(tab_b.get("k").unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_is_published() {
        let tab_a = SharedStorage::in_memory();
        let tab_b = tab_a.tab();
        let mut sub_b = tab_b.subscribe();

        tab_a.remove("cart:gone").unwrap();
        let change = sub_b.recv().await.unwrap();
        assert_eq!(change.key.as_deref(), Some("cart:gone"));
    }

    #[test]
    fn test_resync_change_affects_everything() {
        let change = StorageChange {
            key: None,
            origin: 0,
        };
        assert!(change.affects("cart:any"));
    }
}
