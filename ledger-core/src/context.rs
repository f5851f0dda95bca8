//! Handles shared by the ledger, router and reconciler
//!
//! Built once at boot and passed explicitly; tests build a fresh one per case.

use crate::catalog::WarriorCatalog;
use crate::metrics::Metrics;
use crate::quarantine::QuarantineRegistry;
use crate::storage::LedgerStore;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Store, catalog, quarantine and metrics handles
#[derive(Clone)]
pub struct LedgerContext {
    /// Storage engine
    pub store: Arc<dyn LedgerStore>,
    /// Warrior directory
    pub catalog: Arc<dyn WarriorCatalog>,
    /// Accounts barred from writes
    pub quarantine: Arc<QuarantineRegistry>,
    /// Metrics collector
    pub metrics: Arc<Metrics>,
    /// Serializes compensated transfers that share an idempotency key
    pub transfer_locks: Arc<KeyLocks>,
}

impl LedgerContext {
    /// Context with an empty quarantine registry
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<dyn WarriorCatalog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            catalog,
            quarantine: Arc::new(QuarantineRegistry::new()),
            metrics,
            transfer_locks: Arc::new(KeyLocks::default()),
        }
    }
}

/// Async mutex per string key, removed once nobody holds or waits on it
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Wait for exclusive use of `key`
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// True when no key is held
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held key; released on drop
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Release first so an idle mutex holds only the map's reference
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl fmt::Debug for LedgerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerContext")
            .field("quarantined", &self.quarantine.len())
            .finish_non_exhaustive()
    }
}
