//! In-process storage engine
//!
//! Accounts are serialized through one async mutex per warrior. A
//! transaction stages balances and entries privately and publishes them
//! under the state write lock on commit, which is also where entry ids are
//! assigned, so ids grow strictly with commit order.

use super::{lock_order, AccountAudit, AccountTx, DuplicateKey, LedgerStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{Account, Coins, LedgerEntry, NewLedgerEntry, WarriorId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    accounts: BTreeMap<WarriorId, Account>,
    // ascending by id
    entries: HashMap<WarriorId, Vec<LedgerEntry>>,
    keys: HashSet<(WarriorId, String)>,
    last_entry_id: u64,
}

#[derive(Debug)]
struct Inner {
    partitions: u32,
    locks: DashMap<WarriorId, Arc<Mutex<()>>>,
    state: RwLock<State>,
    fail_next: AtomicU32,
}

/// In-memory ledger store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Single-partition store: any set of accounts can share a transaction
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Store whose accounts are spread over `partitions` by `warrior_id % partitions`
    ///
    /// Accounts in different partitions cannot be locked together.
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                locks: DashMap::new(),
                state: RwLock::new(State::default()),
                fail_next: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `n` calls to [`LedgerStore::begin`] fail as unavailable
    pub fn fail_next(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Overwrite a stored balance without writing a ledger entry
    ///
    /// Simulates out-of-band corruption for reconciliation checks.
    pub fn force_balance(&self, warrior_id: WarriorId, balance: Coins) {
        let mut state = self.inner.state.write();
        if let Some(account) = state.accounts.get_mut(&warrior_id) {
            account.balance = balance;
            account.updated_at = Utc::now();
        }
    }

    /// Append an entry without the uniqueness check or a balance change
    #[cfg(test)]
    pub(crate) fn force_entry(&self, staged: NewLedgerEntry) {
        let mut state = self.inner.state.write();
        state.last_entry_id += 1;
        let entry = LedgerEntry {
            id: state.last_entry_id,
            warrior_id: staged.warrior_id,
            amount: staged.amount,
            kind: staged.kind,
            reason: staged.reason,
            balance_before: staged.balance_before,
            balance_after: staged.balance_after,
            idempotency_key: staged.idempotency_key,
            created_at: Utc::now(),
        };
        state.entries.entry(entry.warrior_id).or_default().push(entry);
    }

    fn partition(&self, warrior_id: WarriorId) -> u64 {
        warrior_id % u64::from(self.inner.partitions)
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self, warrior_ids: &[WarriorId]) -> StoreResult<Box<dyn AccountTx>> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let order = lock_order(warrior_ids);
        if let Some(&first) = order.first() {
            if let Some(&other) = order
                .iter()
                .find(|&&id| self.partition(id) != self.partition(first))
            {
                return Err(StoreError::CrossPartition(first, other));
            }
        }

        let mut guards = Vec::with_capacity(order.len());
        for warrior_id in &order {
            let lock = self
                .inner
                .locks
                .entry(*warrior_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            guards.push(lock.lock_owned().await);
        }
        debug!(accounts = ?order, "Accounts locked");

        Ok(Box::new(MemoryTx {
            inner: self.inner.clone(),
            locked: order,
            balances: HashMap::new(),
            staged: Vec::new(),
            _guards: guards,
        }))
    }

    fn spans_atomically(&self, a: WarriorId, b: WarriorId) -> bool {
        self.partition(a) == self.partition(b)
    }

    async fn get_account(&self, warrior_id: WarriorId) -> StoreResult<Option<Account>> {
        Ok(self.inner.state.read().accounts.get(&warrior_id).cloned())
    }

    async fn insert_account_if_absent(
        &self,
        warrior_id: WarriorId,
        seed: Coins,
    ) -> StoreResult<Account> {
        if seed < 0 {
            return Err(StoreError::Constraint(format!(
                "negative seed for warrior {}",
                warrior_id
            )));
        }

        let mut state = self.inner.state.write();
        let account = state.accounts.entry(warrior_id).or_insert_with(|| {
            let now = Utc::now();
            Account {
                warrior_id,
                balance: seed,
                seed_balance: seed,
                created_at: now,
                updated_at: now,
            }
        });
        Ok(account.clone())
    }

    async fn history(
        &self,
        warrior_id: WarriorId,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.inner.state.read();
        Ok(state
            .entries
            .get(&warrior_id)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_entries(&self, warrior_id: WarriorId) -> StoreResult<u64> {
        let state = self.inner.state.read();
        Ok(state.entries.get(&warrior_id).map_or(0, |e| e.len() as u64))
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<WarriorId>> {
        let state = self.inner.state.read();
        Ok(state
            .accounts
            .values()
            .filter(|account| account.updated_at >= since)
            .map(|account| account.warrior_id)
            .collect())
    }

    async fn audit(&self, warrior_id: WarriorId) -> StoreResult<Option<AccountAudit>> {
        let state = self.inner.state.read();
        let Some(account) = state.accounts.get(&warrior_id) else {
            return Ok(None);
        };
        let entries = state.entries.get(&warrior_id).map(Vec::as_slice).unwrap_or(&[]);

        Ok(Some(AccountAudit {
            warrior_id,
            balance: account.balance,
            seed_balance: account.seed_balance,
            entry_sum: entries.iter().map(|e| e.amount).sum(),
            entry_count: entries.len() as u64,
            last_balance_after: entries.last().map(|e| e.balance_after),
        }))
    }

    async fn duplicate_keys(&self) -> StoreResult<Vec<DuplicateKey>> {
        let state = self.inner.state.read();
        let mut counts: HashMap<(WarriorId, &str), u64> = HashMap::new();
        for entry in state.entries.values().flatten() {
            if let Some(key) = entry.idempotency_key.as_deref() {
                *counts.entry((entry.warrior_id, key)).or_default() += 1;
            }
        }

        Ok(counts
            .into_iter()
            .filter(|(_, occurrences)| *occurrences > 1)
            .map(|((warrior_id, key), occurrences)| DuplicateKey {
                warrior_id,
                idempotency_key: key.to_string(),
                occurrences,
            })
            .collect())
    }

    async fn negative_balances(&self) -> StoreResult<Vec<(WarriorId, Coins)>> {
        let state = self.inner.state.read();
        Ok(state
            .accounts
            .values()
            .filter(|account| account.balance < 0)
            .map(|account| (account.warrior_id, account.balance))
            .collect())
    }

    async fn close(&self) {}
}

struct MemoryTx {
    inner: Arc<Inner>,
    locked: Vec<WarriorId>,
    balances: HashMap<WarriorId, Coins>,
    staged: Vec<NewLedgerEntry>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl MemoryTx {
    fn ensure_locked(&self, warrior_id: WarriorId) -> StoreResult<()> {
        if self.locked.binary_search(&warrior_id).is_ok() {
            Ok(())
        } else {
            Err(StoreError::NotLocked(warrior_id))
        }
    }
}

#[async_trait]
impl AccountTx for MemoryTx {
    async fn account(&mut self, warrior_id: WarriorId) -> StoreResult<Option<Account>> {
        let state = self.inner.state.read();
        Ok(state.accounts.get(&warrior_id).cloned().map(|mut account| {
            if let Some(balance) = self.balances.get(&warrior_id) {
                account.balance = *balance;
            }
            account
        }))
    }

    async fn entry_by_key(
        &mut self,
        warrior_id: WarriorId,
        key: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = self.inner.state.read();
        Ok(state.entries.get(&warrior_id).and_then(|entries| {
            entries
                .iter()
                .rev()
                .find(|entry| entry.idempotency_key.as_deref() == Some(key))
                .cloned()
        }))
    }

    async fn set_balance(&mut self, warrior_id: WarriorId, balance: Coins) -> StoreResult<()> {
        self.ensure_locked(warrior_id)?;
        if !self.inner.state.read().accounts.contains_key(&warrior_id) {
            return Err(StoreError::Constraint(format!(
                "account {} does not exist",
                warrior_id
            )));
        }
        self.balances.insert(warrior_id, balance);
        Ok(())
    }

    async fn append_entries(&mut self, entries: Vec<NewLedgerEntry>) -> StoreResult<()> {
        for entry in &entries {
            self.ensure_locked(entry.warrior_id)?;
        }
        self.staged.extend(entries);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<Vec<LedgerEntry>> {
        let mut state = self.inner.state.write();

        // Validate everything before touching state so a failed commit writes nothing
        for (&warrior_id, &balance) in &self.balances {
            if balance < 0 {
                return Err(StoreError::Constraint(format!(
                    "balance of warrior {} would be negative",
                    warrior_id
                )));
            }
        }
        let mut batch_keys = HashSet::new();
        for entry in &self.staged {
            if let Some(key) = &entry.idempotency_key {
                let pair = (entry.warrior_id, key.clone());
                if state.keys.contains(&pair) || !batch_keys.insert(pair) {
                    return Err(StoreError::DuplicateEntry(entry.warrior_id));
                }
            }
        }

        let now = Utc::now();
        for (&warrior_id, &balance) in &self.balances {
            if let Some(account) = state.accounts.get_mut(&warrior_id) {
                account.balance = balance;
                account.updated_at = now;
            }
        }

        let mut committed = Vec::with_capacity(self.staged.len());
        for staged in &self.staged {
            state.last_entry_id += 1;
            let entry = LedgerEntry {
                id: state.last_entry_id,
                warrior_id: staged.warrior_id,
                amount: staged.amount,
                kind: staged.kind,
                reason: staged.reason.clone(),
                balance_before: staged.balance_before,
                balance_after: staged.balance_after,
                idempotency_key: staged.idempotency_key.clone(),
                created_at: now,
            };
            if let Some(key) = &entry.idempotency_key {
                state.keys.insert((entry.warrior_id, key.clone()));
            }
            state
                .entries
                .entry(entry.warrior_id)
                .or_default()
                .push(entry.clone());
            committed.push(entry);
        }

        Ok(committed)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        debug!(accounts = ?self.locked, "Transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryKind;
    use std::time::Duration;

    fn entry(warrior_id: WarriorId, amount: Coins, before: Coins, key: Option<&str>) -> NewLedgerEntry {
        NewLedgerEntry {
            warrior_id,
            amount,
            kind: EntryKind::DirectAdd,
            reason: "test".to_string(),
            balance_before: before,
            balance_after: before + amount,
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_commit_publishes_balance_and_entries() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 100).await.unwrap();

        let mut tx = store.begin(&[1]).await.unwrap();
        tx.set_balance(1, 150).await.unwrap();
        tx.append_entries(vec![entry(1, 50, 100, Some("k1"))]).await.unwrap();
        let committed = tx.commit().await.unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].id, 1);
        assert_eq!(store.get_account(1).await.unwrap().unwrap().balance, 150);
        assert_eq!(store.count_entries(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 100).await.unwrap();

        {
            let mut tx = store.begin(&[1]).await.unwrap();
            tx.set_balance(1, 0).await.unwrap();
            tx.append_entries(vec![entry(1, -100, 100, None)]).await.unwrap();
        }

        assert_eq!(store.get_account(1).await.unwrap().unwrap().balance, 100);
        assert_eq!(store.count_entries(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_without_partial_write() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 100).await.unwrap();

        let mut tx = store.begin(&[1]).await.unwrap();
        tx.set_balance(1, 110).await.unwrap();
        tx.append_entries(vec![entry(1, 10, 100, Some("dup"))]).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin(&[1]).await.unwrap();
        tx.set_balance(1, 120).await.unwrap();
        tx.append_entries(vec![entry(1, 10, 110, Some("dup"))]).await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(result, Err(StoreError::DuplicateEntry(1))));
        assert_eq!(store.get_account(1).await.unwrap().unwrap().balance, 110);
        assert_eq!(store.count_entries(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_negative_balance_rejected_on_commit() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 10).await.unwrap();

        let mut tx = store.begin(&[1]).await.unwrap();
        tx.set_balance(1, -5).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Constraint(_))));
        assert_eq!(store.get_account(1).await.unwrap().unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_writes_require_lock() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 10).await.unwrap();
        store.insert_account_if_absent(2, 10).await.unwrap();

        let mut tx = store.begin(&[1]).await.unwrap();
        assert!(matches!(
            tx.set_balance(2, 0).await,
            Err(StoreError::NotLocked(2))
        ));
    }

    #[tokio::test]
    async fn test_same_account_serializes() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 10).await.unwrap();

        let held = store.begin(&[1]).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), store.begin(&[1])).await;
        assert!(blocked.is_err());

        drop(held);
        let acquired = tokio::time::timeout(Duration::from_millis(50), store.begin(&[1])).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_partitions_and_cross_partition_begin() {
        let store = MemoryStore::with_partitions(2);
        assert!(store.spans_atomically(2, 4));
        assert!(!store.spans_atomically(1, 2));
        assert!(matches!(
            store.begin(&[1, 2]).await,
            Err(StoreError::CrossPartition(_, _))
        ));
        assert!(store.begin(&[1, 3]).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_is_consumed() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(matches!(store.begin(&[1]).await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.begin(&[1]).await, Err(StoreError::Unavailable(_))));
        assert!(store.begin(&[1]).await.is_ok());
    }

    #[tokio::test]
    async fn test_history_newest_first_with_offset() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(1, 0).await.unwrap();

        let mut balance = 0;
        for _ in 0..5 {
            let mut tx = store.begin(&[1]).await.unwrap();
            tx.set_balance(1, balance + 10).await.unwrap();
            tx.append_entries(vec![entry(1, 10, balance, None)]).await.unwrap();
            tx.commit().await.unwrap();
            balance += 10;
        }

        let page = store.history(1, 2, 1).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3]);

        let audit = store.audit(1).await.unwrap().unwrap();
        assert_eq!(audit.entry_sum, 50);
        assert_eq!(audit.last_balance_after, Some(50));
        assert!(!audit.is_mismatch());
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let store = MemoryStore::new();
        store.insert_account_if_absent(3, 40).await.unwrap();
        let again = store.insert_account_if_absent(3, 999).await.unwrap();
        assert_eq!(again.balance, 40);
        assert_eq!(again.seed_balance, 40);
    }
}
