//! Reconciliation
//!
//! Periodically re-derives every recently touched balance from its ledger
//! and checks the store-wide invariants. A sweep never writes balances or
//! entries; its only side effect is quarantining accounts that fail the
//! balance check so the ledger stops writing to them until cleared.

use crate::{
    config::ReconciliationConfig,
    context::LedgerContext,
    error::Result,
    quarantine::QuarantineRecord,
    storage::DuplicateKey,
    types::{Coins, WarriorId},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Window overlap so commits stamped just before the previous sweep started are still checked
const WATERMARK_OVERLAP_SECS: i64 = 30;

/// Balance that disagrees with its ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDiscrepancy {
    /// Account
    pub warrior_id: WarriorId,
    /// Balance held in the account row
    pub stored_balance: Coins,
    /// Seed plus the sum of every entry
    pub expected_balance: Coins,
    /// `stored_balance - expected_balance`
    pub discrepancy: Coins,
    /// `balance_after` of the newest entry
    pub last_balance_after: Option<Coins>,
    /// Entries examined
    pub entry_count: u64,
}

/// Account holding a negative balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegativeBalance {
    /// Account
    pub warrior_id: WarriorId,
    /// Offending balance
    pub balance: Coins,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    /// Sweep id
    pub id: Uuid,
    /// Accounts touched at or after this instant were checked
    pub window_start: Option<DateTime<Utc>>,
    /// Sweep start
    pub started_at: DateTime<Utc>,
    /// Sweep end
    pub finished_at: DateTime<Utc>,
    /// Accounts audited
    pub accounts_checked: u64,
    /// Balance mismatches
    pub discrepancies: Vec<BalanceDiscrepancy>,
    /// Negative balances anywhere in the store
    pub negative_balances: Vec<NegativeBalance>,
    /// Keys applied more than once
    pub duplicate_keys: Vec<DuplicateKey>,
    /// Accounts this sweep quarantined
    pub newly_quarantined: Vec<WarriorId>,
}

impl ReconciliationReport {
    /// No invariant violated
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
            && self.negative_balances.is_empty()
            && self.duplicate_keys.is_empty()
    }
}

/// Invariant checker
#[derive(Debug)]
pub struct Reconciler {
    ctx: LedgerContext,
    config: ReconciliationConfig,
    // Start of the previous sweep; held for the whole sweep so sweeps never overlap
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl Reconciler {
    /// Create a reconciler over `ctx`
    pub fn new(ctx: LedgerContext, config: ReconciliationConfig) -> Self {
        Self {
            ctx,
            config,
            watermark: Mutex::new(None),
        }
    }

    /// Check every account touched since the previous sweep
    ///
    /// The first sweep checks every account.
    pub async fn sweep(&self) -> Result<ReconciliationReport> {
        let mut watermark = self.watermark.lock().await;
        let started_at = Utc::now();
        let window_start = *watermark;
        let since = window_start
            .map(|w| w - ChronoDuration::seconds(WATERMARK_OVERLAP_SECS))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let store = &self.ctx.store;
        let touched = store.touched_since(since).await?;

        let mut discrepancies = Vec::new();
        let mut newly_quarantined = Vec::new();

        for warrior_id in &touched {
            let Some(audit) = store.audit(*warrior_id).await? else {
                continue;
            };
            if !audit.is_mismatch() {
                continue;
            }

            let discrepancy = BalanceDiscrepancy {
                warrior_id: audit.warrior_id,
                stored_balance: audit.balance,
                expected_balance: audit.expected_balance(),
                discrepancy: audit.balance - audit.expected_balance(),
                last_balance_after: audit.last_balance_after,
                entry_count: audit.entry_count,
            };
            error!(
                warrior_id = discrepancy.warrior_id,
                stored = discrepancy.stored_balance,
                expected = discrepancy.expected_balance,
                "Integrity alarm: balance disagrees with ledger"
            );
            self.ctx.metrics.reconciliation_mismatches.inc();

            if self.config.quarantine_on_mismatch
                && self.ctx.quarantine.quarantine(
                    discrepancy.warrior_id,
                    format!(
                        "balance {} expected {}",
                        discrepancy.stored_balance, discrepancy.expected_balance
                    ),
                )
            {
                newly_quarantined.push(discrepancy.warrior_id);
            }
            discrepancies.push(discrepancy);
        }

        let negative_balances: Vec<NegativeBalance> = store
            .negative_balances()
            .await?
            .into_iter()
            .map(|(warrior_id, balance)| NegativeBalance { warrior_id, balance })
            .collect();
        for negative in &negative_balances {
            error!(
                warrior_id = negative.warrior_id,
                balance = negative.balance,
                "Integrity alarm: negative balance"
            );
        }

        let duplicate_keys = store.duplicate_keys().await?;
        for duplicate in &duplicate_keys {
            error!(
                warrior_id = duplicate.warrior_id,
                occurrences = duplicate.occurrences,
                "Integrity alarm: idempotency key applied more than once"
            );
        }

        *watermark = Some(started_at);
        self.ctx.metrics.reconciliation_sweeps.inc();
        self.ctx
            .metrics
            .quarantined_accounts
            .set(self.ctx.quarantine.len() as i64);

        Ok(ReconciliationReport {
            id: Uuid::new_v4(),
            window_start,
            started_at,
            finished_at: Utc::now(),
            accounts_checked: touched.len() as u64,
            discrepancies,
            negative_balances,
            duplicate_keys,
            newly_quarantined,
        })
    }

    /// Lift a quarantine
    pub fn clear_quarantine(&self, warrior_id: WarriorId) -> Option<QuarantineRecord> {
        let cleared = self.ctx.quarantine.clear(warrior_id);
        if cleared.is_some() {
            info!(warrior_id, "Quarantine cleared");
            self.ctx
                .metrics
                .quarantined_accounts
                .set(self.ctx.quarantine.len() as i64);
        }
        cleared
    }

    /// Sweep on the configured cadence until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting reconciliation loop with {} second interval",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.is_clean() => {
                    info!(
                        accounts = report.accounts_checked,
                        "Reconciliation sweep clean"
                    );
                }
                Ok(report) => {
                    warn!(
                        accounts = report.accounts_checked,
                        discrepancies = report.discrepancies.len(),
                        negative = report.negative_balances.len(),
                        duplicates = report.duplicate_keys.len(),
                        "Reconciliation sweep found violations"
                    );
                }
                Err(e) => {
                    error!(class = e.class(), "Reconciliation sweep failed: {}", e);
                }
            }
        }

        info!("Reconciliation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::metrics::Metrics;
    use crate::storage::MemoryStore;
    use crate::types::{EntryKind, LedgerCommand, NewLedgerEntry};
    use crate::{config::LedgerConfig, Ledger};
    use std::sync::Arc;

    fn setup() -> (MemoryStore, Ledger, Reconciler) {
        let store = MemoryStore::new();
        let ctx = LedgerContext::new(
            Arc::new(store.clone()),
            Arc::new(StaticCatalog::with_seeds([(1, 1000), (2, 500)])),
            Arc::new(Metrics::new().unwrap()),
        );
        let ledger = Ledger::new(ctx.clone(), LedgerConfig::default());
        let reconciler = Reconciler::new(ctx, ReconciliationConfig::default());
        (store, ledger, reconciler)
    }

    #[tokio::test]
    async fn test_clean_sweep() {
        let (_store, ledger, reconciler) = setup();
        ledger.deduct(1, 300, "potion").await.unwrap();
        ledger.add(2, 20, "bonus").await.unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.accounts_checked, 2);
        assert!(report.window_start.is_none());
    }

    #[tokio::test]
    async fn test_mismatch_quarantines_account() {
        let (store, ledger, reconciler) = setup();
        ledger.deduct(1, 300, "potion").await.unwrap();
        store.force_balance(1, 9_999);

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.discrepancies.len(), 1);
        assert_eq!(report.discrepancies[0].expected_balance, 700);
        assert_eq!(report.discrepancies[0].discrepancy, 9_299);
        assert_eq!(report.newly_quarantined, vec![1]);

        // Sweeps observe only; the corrupt balance is left for an operator
        assert_eq!(ledger.balance(1).await.unwrap(), 9_999);
        assert!(ledger.add(1, 1, "x").await.is_err());

        assert!(reconciler.clear_quarantine(1).is_some());
        assert!(ledger.context().quarantine.is_empty());
    }

    #[tokio::test]
    async fn test_second_sweep_reports_existing_quarantine_once() {
        let (store, ledger, reconciler) = setup();
        ledger.add(2, 5, "x").await.unwrap();
        store.force_balance(2, 1);

        let first = reconciler.sweep().await.unwrap();
        let second = reconciler.sweep().await.unwrap();
        assert_eq!(first.newly_quarantined, vec![2]);
        assert!(second.newly_quarantined.is_empty());
        assert!(second.window_start.is_some());
    }

    #[tokio::test]
    async fn test_negative_balance_reported() {
        let (store, ledger, reconciler) = setup();
        ledger.balance(1).await.unwrap();
        store.force_balance(1, -5);

        let report = reconciler.sweep().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(
            report.negative_balances,
            vec![NegativeBalance {
                warrior_id: 1,
                balance: -5
            }]
        );
    }

    #[tokio::test]
    async fn test_duplicate_key_reported() {
        let (store, ledger, reconciler) = setup();
        let applied = ledger
            .apply(
                LedgerCommand::credit(2, 50, EntryKind::ArenaVictory, "arena")
                    .with_key("arena:m-1:winner"),
            )
            .await
            .unwrap();

        // Same key written twice, balances left consistent
        store.force_entry(NewLedgerEntry {
            warrior_id: 2,
            amount: 0,
            kind: EntryKind::ArenaVictory,
            reason: "arena".to_string(),
            balance_before: applied.balance_after,
            balance_after: applied.balance_after,
            idempotency_key: Some("arena:m-1:winner".to_string()),
        });

        let report = reconciler.sweep().await.unwrap();
        assert!(report.discrepancies.is_empty());
        assert!(!report.is_clean());
        assert_eq!(report.duplicate_keys.len(), 1);
        assert_eq!(report.duplicate_keys[0].warrior_id, 2);
        assert_eq!(report.duplicate_keys[0].idempotency_key, "arena:m-1:winner");
        assert_eq!(report.duplicate_keys[0].occurrences, 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_store, _ledger, reconciler) = setup();
        let reconciler = Arc::new(reconciler);
        let (tx, rx) = watch::channel(false);

        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(rx).await })
        };
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
