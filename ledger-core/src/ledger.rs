//! Ledger core
//!
//! The single mutator of balances. Every successful operation appends
//! exactly one ledger entry per affected account inside the same store
//! transaction as the balance change.
//!
//! # Example
//!
//! ```no_run
//! use coin_ledger::{
//!     catalog::StaticCatalog, config::LedgerConfig, metrics::Metrics, storage::MemoryStore,
//!     Ledger, LedgerContext,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = LedgerContext::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(StaticCatalog::with_seeds([(1, 1000)])),
//!     Arc::new(Metrics::new()?),
//! );
//! let ledger = Ledger::new(ctx, LedgerConfig::default());
//!
//! let outcome = ledger.deduct(1, 300, "potion").await?;
//! assert_eq!(outcome.balance_after, 700);
//! # Ok(())
//! # }
//! ```

use crate::{
    config::LedgerConfig,
    context::LedgerContext,
    error::{LedgerError, Result},
    storage::AccountTx,
    types::{
        Account, ApplyOutcome, Coins, EntryKind, HistoryPage, LedgerCommand, LedgerEntry,
        Movement, NewLedgerEntry, OverdraftPolicy, TransferOutcome, TransferRequest, WarriorId,
    },
};
use message_bus::RetryPolicy;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Attempts at writing a reversing credit before giving up
const COMPENSATION_ATTEMPTS: u32 = 3;

/// Result of staging one leg inside a transaction
enum Leg {
    /// Idempotency key already applied; nothing staged
    Replayed(ApplyOutcome),
    /// Balance and entry staged, waiting for commit
    Pending {
        warrior_id: WarriorId,
        balance_before: Coins,
        balance_after: Coins,
        applied: Coins,
    },
}

impl Leg {
    fn is_replayed(&self) -> bool {
        matches!(self, Leg::Replayed(_))
    }

    /// Final outcome once the transaction committed `committed`
    fn resolve(self, committed: &[LedgerEntry]) -> Result<ApplyOutcome> {
        match self {
            Leg::Replayed(outcome) => Ok(outcome),
            Leg::Pending {
                warrior_id,
                balance_before,
                balance_after,
                applied,
            } => {
                let entry = committed
                    .iter()
                    .find(|e| e.warrior_id == warrior_id)
                    .ok_or_else(|| {
                        LedgerError::Internal(format!(
                            "commit returned no entry for warrior {}",
                            warrior_id
                        ))
                    })?;
                Ok(ApplyOutcome {
                    warrior_id,
                    entry_id: entry.id,
                    balance_before,
                    balance_after,
                    applied,
                    replayed: false,
                })
            }
        }
    }
}

fn validate_amount(amount: Coins) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

/// Main ledger interface
#[derive(Debug, Clone)]
pub struct Ledger {
    ctx: LedgerContext,
    config: LedgerConfig,
}

impl Ledger {
    /// Create a ledger over `ctx`
    pub fn new(ctx: LedgerContext, config: LedgerConfig) -> Self {
        Self { ctx, config }
    }

    /// Shared handles
    pub fn context(&self) -> &LedgerContext {
        &self.ctx
    }

    /// Ledger settings
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Existing account, or a new one seeded from the warrior catalog
    pub async fn ensure_account(&self, warrior_id: WarriorId) -> Result<Account> {
        if let Some(account) = self.ctx.store.get_account(warrior_id).await? {
            return Ok(account);
        }
        if !self.config.seed_on_first_touch {
            return Err(LedgerError::NotFound(warrior_id));
        }

        let profile = self
            .ctx
            .catalog
            .get_warrior(warrior_id)
            .await?
            .ok_or(LedgerError::NotFound(warrior_id))?;

        let seed = profile.coin_balance_seed.max(0);
        let account = self
            .ctx
            .store
            .insert_account_if_absent(warrior_id, seed)
            .await?;
        info!(warrior_id, seed = account.seed_balance, "Account seeded from warrior catalog");

        Ok(account)
    }

    /// Apply one credit or debit
    ///
    /// A command whose idempotency key was already applied returns the stored
    /// outcome with `replayed` set and writes nothing.
    pub async fn apply(&self, cmd: LedgerCommand) -> Result<ApplyOutcome> {
        let start = Instant::now();
        let result = self.apply_once(&cmd).await;
        self.ctx
            .metrics
            .apply_duration
            .observe(start.elapsed().as_secs_f64());

        self.record(
            cmd.kind,
            cmd.warrior_id,
            cmd.movement.amount(),
            result.as_ref().map(|o| o.replayed),
        );
        result
    }

    /// Direct credit from the command API
    pub async fn add(
        &self,
        warrior_id: WarriorId,
        amount: Coins,
        reason: impl Into<String>,
    ) -> Result<ApplyOutcome> {
        self.apply(LedgerCommand::credit(warrior_id, amount, EntryKind::DirectAdd, reason))
            .await
    }

    /// Direct debit from the command API
    pub async fn deduct(
        &self,
        warrior_id: WarriorId,
        amount: Coins,
        reason: impl Into<String>,
    ) -> Result<ApplyOutcome> {
        self.apply(LedgerCommand::debit(warrior_id, amount, EntryKind::DirectDeduct, reason))
            .await
    }

    /// Move coins between two warriors
    ///
    /// Both legs commit in one transaction when the store can lock both
    /// accounts together. Otherwise the legs commit separately and a failed
    /// credit is undone with a `TransferRollback` entry on the sender.
    pub async fn transfer(&self, req: TransferRequest) -> Result<TransferOutcome> {
        let start = Instant::now();
        let result = self.transfer_once(&req).await;
        self.ctx
            .metrics
            .apply_duration
            .observe(start.elapsed().as_secs_f64());

        self.record(
            req.kind,
            req.from,
            req.amount,
            result.as_ref().map(|o| o.replayed),
        );
        result
    }

    /// Current balance
    pub async fn balance(&self, warrior_id: WarriorId) -> Result<Coins> {
        Ok(self.ensure_account(warrior_id).await?.balance)
    }

    /// Entries newest first; a zero `limit` means the default page size
    pub async fn history(
        &self,
        warrior_id: WarriorId,
        limit: u32,
        offset: u32,
    ) -> Result<HistoryPage> {
        self.ensure_account(warrior_id).await?;

        let limit = self.config.history_limit(limit);
        let entries = self.ctx.store.history(warrior_id, limit, offset).await?;
        let total_count = self.ctx.store.count_entries(warrior_id).await?;

        Ok(HistoryPage {
            warrior_id,
            entries,
            total_count,
            limit,
            offset,
        })
    }

    async fn apply_once(&self, cmd: &LedgerCommand) -> Result<ApplyOutcome> {
        validate_amount(cmd.movement.amount())?;

        let deadline = cmd
            .timeout
            .unwrap_or_else(|| self.config.operation_timeout());

        let (tx, leg) = tokio::time::timeout(deadline, async {
            self.ensure_account(cmd.warrior_id).await?;
            let mut tx = self.ctx.store.begin(&[cmd.warrior_id]).await?;
            let leg = self.stage(tx.as_mut(), cmd).await?;
            Ok::<_, LedgerError>((tx, leg))
        })
        .await
        .map_err(|_| LedgerError::Cancelled)??;

        // Past this point the deadline no longer applies
        if leg.is_replayed() {
            tx.rollback().await?;
            return leg.resolve(&[]);
        }
        let committed = tx.commit().await?;
        leg.resolve(&committed)
    }

    /// Stage one leg: replay check, quarantine, overdraft, balance and entry
    async fn stage(&self, tx: &mut dyn AccountTx, cmd: &LedgerCommand) -> Result<Leg> {
        let warrior_id = cmd.warrior_id;

        if let Some(key) = cmd.idempotency_key.as_deref() {
            if let Some(entry) = tx.entry_by_key(warrior_id, key).await? {
                debug!(warrior_id, entry_id = entry.id, "Idempotent replay");
                return Ok(Leg::Replayed(ApplyOutcome {
                    warrior_id,
                    entry_id: entry.id,
                    balance_before: entry.balance_before,
                    balance_after: entry.balance_after,
                    applied: entry.amount,
                    replayed: true,
                }));
            }
        }

        // Reversing credits must land even on a quarantined sender
        if cmd.kind != EntryKind::TransferRollback && self.ctx.quarantine.is_quarantined(warrior_id)
        {
            return Err(LedgerError::Quarantined(warrior_id));
        }

        let account = tx
            .account(warrior_id)
            .await?
            .ok_or(LedgerError::NotFound(warrior_id))?;
        let balance = account.balance;

        let delta = match cmd.movement {
            Movement::Debit(amount) if amount > balance => match cmd.overdraft {
                OverdraftPolicy::Clamp if balance > 0 => -balance,
                _ => {
                    return Err(LedgerError::InsufficientFunds {
                        warrior_id,
                        balance,
                        requested: amount,
                    })
                }
            },
            movement => movement.delta(),
        };
        let balance_after = balance
            .checked_add(delta)
            .ok_or(LedgerError::InvalidAmount(cmd.movement.amount()))?;

        tx.set_balance(warrior_id, balance_after).await?;
        tx.append_entries(vec![NewLedgerEntry {
            warrior_id,
            amount: delta,
            kind: cmd.kind,
            reason: cmd.reason.clone(),
            balance_before: balance,
            balance_after,
            idempotency_key: cmd.idempotency_key.clone(),
        }])
        .await?;

        Ok(Leg::Pending {
            warrior_id,
            balance_before: balance,
            balance_after,
            applied: delta,
        })
    }

    async fn transfer_once(&self, req: &TransferRequest) -> Result<TransferOutcome> {
        if req.from == req.to {
            return Err(LedgerError::InvalidTransfer(req.from));
        }
        validate_amount(req.amount)?;

        let key = req
            .idempotency_key
            .clone()
            .unwrap_or_else(|| format!("xfer:{}", Uuid::new_v4()));

        let mut out_leg = LedgerCommand::debit(
            req.from,
            req.amount,
            req.kind,
            format!("transfer_out: {}", req.reason),
        )
        .with_key(format!("{}:out", key));
        let mut in_leg = LedgerCommand::credit(
            req.to,
            req.amount,
            req.kind,
            format!("transfer_in: {}", req.reason),
        )
        .with_key(format!("{}:in", key));
        out_leg.timeout = req.timeout;
        in_leg.timeout = req.timeout;

        if self.ctx.store.spans_atomically(req.from, req.to) {
            self.transfer_joint(req, key, &out_leg, &in_leg).await
        } else {
            self.transfer_compensated(req, key, &out_leg, &in_leg).await
        }
    }

    async fn transfer_joint(
        &self,
        req: &TransferRequest,
        key: String,
        out_leg: &LedgerCommand,
        in_leg: &LedgerCommand,
    ) -> Result<TransferOutcome> {
        let deadline = req
            .timeout
            .unwrap_or_else(|| self.config.operation_timeout());

        let (tx, out_staged, in_staged) = tokio::time::timeout(deadline, async {
            self.ensure_account(req.from).await?;
            self.ensure_account(req.to).await?;

            // begin() locks both rows in ascending id order
            let mut tx = self.ctx.store.begin(&[req.from, req.to]).await?;
            let out_staged = self.stage(tx.as_mut(), out_leg).await?;
            let in_staged = self.stage(tx.as_mut(), in_leg).await?;
            Ok::<_, LedgerError>((tx, out_staged, in_staged))
        })
        .await
        .map_err(|_| LedgerError::Cancelled)??;

        let committed = if out_staged.is_replayed() && in_staged.is_replayed() {
            tx.rollback().await?;
            Vec::new()
        } else {
            tx.commit().await?
        };

        let out = out_staged.resolve(&committed)?;
        let inn = in_staged.resolve(&committed)?;
        Ok(transfer_outcome(key, &out, &inn))
    }

    async fn transfer_compensated(
        &self,
        req: &TransferRequest,
        key: String,
        out_leg: &LedgerCommand,
        in_leg: &LedgerCommand,
    ) -> Result<TransferOutcome> {
        // Calls sharing a key run one at a time, so a retry cannot credit
        // the receiver while the first call is still compensating
        let _guard = self.ctx.transfer_locks.lock(&key).await;
        let deadline = req
            .timeout
            .unwrap_or_else(|| self.config.operation_timeout());

        let rollback_key = format!("{}:rollback", key);
        if self.entry_recorded(req.from, &rollback_key, deadline).await? {
            // Already reversed; crediting now would create coins
            return Err(LedgerError::DuplicateEntry(req.from));
        }

        let rollback = LedgerCommand::credit(
            req.from,
            req.amount,
            EntryKind::TransferRollback,
            format!("transfer_rollback: {}", req.reason),
        )
        .with_key(rollback_key);

        let out = self.apply_once(out_leg).await?;

        let in_key = in_leg.idempotency_key.as_deref().unwrap_or_default();
        if out.replayed && !self.entry_recorded(req.to, in_key, deadline).await? {
            // An earlier call debited the sender and stopped before the
            // credit; it can only finish as a rollback
            warn!(
                from = req.from,
                to = req.to,
                amount = req.amount,
                "Resuming interrupted transfer as a rollback"
            );
            self.compensate(rollback).await?;
            return Err(LedgerError::DuplicateEntry(req.from));
        }

        match self.apply_once(in_leg).await {
            Ok(inn) => Ok(transfer_outcome(key, &out, &inn)),
            Err(err) => {
                warn!(
                    from = req.from,
                    to = req.to,
                    amount = req.amount,
                    class = err.class(),
                    "Transfer credit leg failed, compensating sender"
                );

                self.compensate(rollback).await?;
                Err(err)
            }
        }
    }

    /// Whether `key` is already on `warrior_id`'s ledger, waiting at most
    /// the operation deadline for the row
    async fn entry_recorded(
        &self,
        warrior_id: WarriorId,
        key: &str,
        deadline: Duration,
    ) -> Result<bool> {
        tokio::time::timeout(deadline, async {
            if self.ctx.store.get_account(warrior_id).await?.is_none() {
                return Ok(false);
            }
            let mut tx = self.ctx.store.begin(&[warrior_id]).await?;
            let found = tx.entry_by_key(warrior_id, key).await?.is_some();
            tx.rollback().await?;
            Ok(found)
        })
        .await
        .map_err(|_| LedgerError::Cancelled)?
    }

    /// Write a reversing credit, retrying transient failures
    async fn compensate(&self, rollback: LedgerCommand) -> Result<ApplyOutcome> {
        let retry = RetryPolicy::default();
        let mut attempt = 0;

        loop {
            match self.apply_once(&rollback).await {
                Ok(outcome) => {
                    self.ctx.metrics.compensations_total.inc();
                    self.record(rollback.kind, rollback.warrior_id, rollback.movement.amount(), Ok(outcome.replayed));
                    info!(
                        warrior_id = rollback.warrior_id,
                        amount = rollback.movement.amount(),
                        entry_id = outcome.entry_id,
                        "Transfer compensated"
                    );
                    return Ok(outcome);
                }
                Err(err) if err.is_transient() && attempt + 1 < COMPENSATION_ATTEMPTS => {
                    let delay: Duration = retry.delay(attempt);
                    attempt += 1;
                    warn!(
                        warrior_id = rollback.warrior_id,
                        attempt,
                        class = err.class(),
                        "Compensation failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        warrior_id = rollback.warrior_id,
                        amount = rollback.movement.amount(),
                        class = err.class(),
                        "Compensation failed, sender left debited"
                    );
                    return Err(LedgerError::CompensationFailed {
                        warrior_id: rollback.warrior_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Metrics plus one log line per rejected operation
    fn record(
        &self,
        kind: EntryKind,
        warrior_id: WarriorId,
        amount: Coins,
        outcome: std::result::Result<bool, &LedgerError>,
    ) {
        match outcome {
            Ok(false) => self.ctx.metrics.record_operation(kind.as_str(), "ok"),
            Ok(true) => self.ctx.metrics.record_operation(kind.as_str(), "replayed"),
            Err(err) => {
                self.ctx.metrics.record_operation(kind.as_str(), err.class());
                warn!(
                    warrior_id,
                    amount,
                    kind = %kind,
                    class = err.class(),
                    "Ledger operation rejected"
                );
            }
        }
    }
}

fn transfer_outcome(key: String, out: &ApplyOutcome, inn: &ApplyOutcome) -> TransferOutcome {
    TransferOutcome {
        from_before: out.balance_before,
        from_after: out.balance_after,
        to_before: inn.balance_before,
        to_after: inn.balance_after,
        idempotency_key: key,
        replayed: out.replayed && inn.replayed,
    }
}
