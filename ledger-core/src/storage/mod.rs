//! Storage engine
//!
//! A [`LedgerStore`] hands out [`AccountTx`] handles that hold exclusive
//! locks on a fixed set of accounts. Locks are always taken in ascending
//! warrior id order, so two transactions over overlapping sets cannot
//! deadlock. Writes made through a handle become visible atomically on
//! [`AccountTx::commit`]; a handle dropped without committing rolls back.
//!
//! Two engines are provided:
//!
//! - [`PgStore`] - Postgres via sqlx, row locks with `SELECT ... FOR UPDATE`
//! - [`MemoryStore`] - in-process engine for tests and local runs

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::{StoreError, StoreResult};
use crate::types::{Account, Coins, LedgerEntry, NewLedgerEntry, WarriorId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Transactional handle over a locked set of accounts
#[async_trait]
pub trait AccountTx: Send {
    /// Account as seen by this transaction, including staged writes
    async fn account(&mut self, warrior_id: WarriorId) -> StoreResult<Option<Account>>;

    /// Committed entry carrying `key` for this warrior
    async fn entry_by_key(
        &mut self,
        warrior_id: WarriorId,
        key: &str,
    ) -> StoreResult<Option<LedgerEntry>>;

    /// Stage a new balance for a locked account
    async fn set_balance(&mut self, warrior_id: WarriorId, balance: Coins) -> StoreResult<()>;

    /// Stage ledger entries, appended in order
    async fn append_entries(&mut self, entries: Vec<NewLedgerEntry>) -> StoreResult<()>;

    /// Make every staged write durable; returns the appended entries with their ids
    async fn commit(self: Box<Self>) -> StoreResult<Vec<LedgerEntry>>;

    /// Discard every staged write
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Per-account figures reconciliation compares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountAudit {
    /// Account
    pub warrior_id: WarriorId,
    /// Stored balance
    pub balance: Coins,
    /// Balance the account was created with
    pub seed_balance: Coins,
    /// Sum of every entry amount
    pub entry_sum: Coins,
    /// Number of entries
    pub entry_count: u64,
    /// `balance_after` of the newest entry
    pub last_balance_after: Option<Coins>,
}

impl AccountAudit {
    /// Balance the ledger says the account should hold
    pub fn expected_balance(&self) -> Coins {
        self.seed_balance + self.entry_sum
    }

    /// Stored balance disagrees with the ledger
    pub fn is_mismatch(&self) -> bool {
        self.balance != self.expected_balance()
            || self
                .last_balance_after
                .map_or(false, |after| after != self.balance)
    }
}

/// Idempotency key present more than once for one warrior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateKey {
    /// Account
    pub warrior_id: WarriorId,
    /// Repeated key
    pub idempotency_key: String,
    /// Number of entries carrying it
    pub occurrences: u64,
}

/// Persistence of accounts and ledger entries
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Lock `warrior_ids` (ascending, duplicates ignored) and open a transaction
    async fn begin(&self, warrior_ids: &[WarriorId]) -> StoreResult<Box<dyn AccountTx>>;

    /// Whether both accounts can be locked by a single transaction
    fn spans_atomically(&self, a: WarriorId, b: WarriorId) -> bool;

    /// Point read of one account
    async fn get_account(&self, warrior_id: WarriorId) -> StoreResult<Option<Account>>;

    /// Create the account with `seed` unless it already exists; returns the stored row
    async fn insert_account_if_absent(&self, warrior_id: WarriorId, seed: Coins)
        -> StoreResult<Account>;

    /// Entries for one warrior, newest first
    async fn history(
        &self,
        warrior_id: WarriorId,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Number of entries for one warrior
    async fn count_entries(&self, warrior_id: WarriorId) -> StoreResult<u64>;

    /// Accounts updated at or after `since`
    async fn touched_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<WarriorId>>;

    /// Audit figures for one account
    async fn audit(&self, warrior_id: WarriorId) -> StoreResult<Option<AccountAudit>>;

    /// Keys applied more than once for the same warrior
    async fn duplicate_keys(&self) -> StoreResult<Vec<DuplicateKey>>;

    /// Accounts holding a negative balance
    async fn negative_balances(&self) -> StoreResult<Vec<(WarriorId, Coins)>>;

    /// Release connections
    async fn close(&self);
}

/// Open the store a DSN names
///
/// `memory://` (optionally `memory://?partitions=N`) selects [`MemoryStore`];
/// `postgres://` and `postgresql://` select [`PgStore`] and run migrations.
pub async fn open(dsn: &str, max_connections: u32) -> StoreResult<Arc<dyn LedgerStore>> {
    if let Some(rest) = dsn.strip_prefix("memory://") {
        let partitions = memory_partitions(rest)?;
        info!(partitions, "Using in-memory ledger store");
        return Ok(Arc::new(MemoryStore::with_partitions(partitions)));
    }

    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        let store = PgStore::connect(dsn, max_connections).await?;
        store.migrate().await?;
        info!("Connected to Postgres ledger store");
        return Ok(Arc::new(store));
    }

    Err(StoreError::Unavailable(format!(
        "unsupported store DSN scheme: {}",
        dsn.split("://").next().unwrap_or_default()
    )))
}

fn memory_partitions(query: &str) -> StoreResult<u32> {
    let query = query.trim_start_matches('?');
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        if let Some(value) = pair.strip_prefix("partitions=") {
            return value
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| StoreError::Unavailable(format!("invalid partitions: {}", value)));
        }
    }
    Ok(1)
}

/// Sorted, de-duplicated lock order
pub(crate) fn lock_order(warrior_ids: &[WarriorId]) -> Vec<WarriorId> {
    let mut ids = warrior_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_order_sorted_and_unique() {
        assert_eq!(lock_order(&[9, 2, 9, 5]), vec![2, 5, 9]);
        assert!(lock_order(&[]).is_empty());
    }

    #[test]
    fn test_memory_partitions_from_dsn() {
        assert_eq!(memory_partitions("").unwrap(), 1);
        assert_eq!(memory_partitions("?partitions=4").unwrap(), 4);
        assert!(memory_partitions("?partitions=0").is_err());
        assert!(memory_partitions("?partitions=x").is_err());
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_scheme() {
        assert!(open("mysql://localhost/coins", 1).await.is_err());
        let store = open("memory://?partitions=2", 1).await.unwrap();
        assert!(!store.spans_atomically(1, 2));
    }

    #[test]
    fn test_audit_mismatch() {
        let mut audit = AccountAudit {
            warrior_id: 1,
            balance: 700,
            seed_balance: 1000,
            entry_sum: -300,
            entry_count: 1,
            last_balance_after: Some(700),
        };
        assert!(!audit.is_mismatch());

        audit.balance = 650;
        assert!(audit.is_mismatch());

        audit.balance = 700;
        audit.last_balance_after = Some(710);
        assert!(audit.is_mismatch());
    }
}
