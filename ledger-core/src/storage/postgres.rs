//! Postgres storage engine
//!
//! Account rows are locked with `SELECT ... FOR UPDATE` in ascending id
//! order. Balances and entries are written inside the sqlx transaction, so
//! the database's own atomicity covers a failed or abandoned commit.

use super::{lock_order, AccountAudit, AccountTx, DuplicateKey, LedgerStore};
use crate::error::{StoreError, StoreResult};
use crate::types::{Account, Coins, EntryKind, LedgerEntry, NewLedgerEntry, WarriorId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info};

/// Postgres-backed ledger store
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool to `database_url`
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded schema migrations
    pub async fn migrate(&self) -> StoreResult<()> {
        info!("Running coin ledger migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))
    }
}

fn db_id(warrior_id: WarriorId) -> StoreResult<i64> {
    i64::try_from(warrior_id)
        .map_err(|_| StoreError::Constraint(format!("warrior id {} out of range", warrior_id)))
}

fn to_warrior_id(raw: i64) -> StoreResult<WarriorId> {
    WarriorId::try_from(raw).map_err(|_| StoreError::Corrupt(format!("warrior id {}", raw)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[derive(Debug, FromRow)]
struct AccountRow {
    warrior_id: i64,
    balance: i64,
    seed_balance: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> StoreResult<Self> {
        Ok(Account {
            warrior_id: to_warrior_id(row.warrior_id)?,
            balance: row.balance,
            seed_balance: row.seed_balance,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: i64,
    warrior_id: i64,
    amount: i64,
    kind: String,
    reason: String,
    balance_before: i64,
    balance_after: i64,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EntryRow> for LedgerEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> StoreResult<Self> {
        Ok(LedgerEntry {
            id: u64::try_from(row.id)
                .map_err(|_| StoreError::Corrupt(format!("entry id {}", row.id)))?,
            warrior_id: to_warrior_id(row.warrior_id)?,
            amount: row.amount,
            kind: row.kind.parse::<EntryKind>().map_err(StoreError::Corrupt)?,
            reason: row.reason,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct AuditRow {
    warrior_id: i64,
    balance: i64,
    seed_balance: i64,
    entry_sum: i64,
    entry_count: i64,
    last_balance_after: Option<i64>,
}

const SELECT_ACCOUNT: &str = r#"
    SELECT warrior_id, balance, seed_balance, created_at, updated_at
    FROM accounts WHERE warrior_id = $1
"#;

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self, warrior_ids: &[WarriorId]) -> StoreResult<Box<dyn AccountTx>> {
        let order = lock_order(warrior_ids);
        let ids = order
            .iter()
            .map(|id| db_id(*id))
            .collect::<StoreResult<Vec<i64>>>()?;

        let mut tx = self.pool.begin().await?;

        // ORDER BY makes Postgres take the row locks in ascending id order
        sqlx::query(
            r#"
            SELECT warrior_id FROM accounts
            WHERE warrior_id = ANY($1)
            ORDER BY warrior_id
            FOR UPDATE
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        debug!(accounts = ?order, "Account rows locked");

        Ok(Box::new(PgTx {
            tx,
            locked: order,
            appended: Vec::new(),
        }))
    }

    fn spans_atomically(&self, _a: WarriorId, _b: WarriorId) -> bool {
        true
    }

    async fn get_account(&self, warrior_id: WarriorId) -> StoreResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
            .bind(db_id(warrior_id)?)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Account::try_from).transpose()
    }

    async fn insert_account_if_absent(
        &self,
        warrior_id: WarriorId,
        seed: Coins,
    ) -> StoreResult<Account> {
        let id = db_id(warrior_id)?;

        sqlx::query(
            r#"
            INSERT INTO accounts (warrior_id, balance, seed_balance, created_at, updated_at)
            VALUES ($1, $2, $2, NOW(), NOW())
            ON CONFLICT (warrior_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(seed)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Account::try_from(row)
    }

    async fn history(
        &self,
        warrior_id: WarriorId,
        limit: u32,
        offset: u32,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT * FROM ledger_entries
            WHERE warrior_id = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(db_id(warrior_id)?)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn count_entries(&self, warrior_id: WarriorId) -> StoreResult<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE warrior_id = $1")
                .bind(db_id(warrior_id)?)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.max(0) as u64)
    }

    async fn touched_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<WarriorId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT warrior_id FROM accounts WHERE updated_at >= $1")
                .bind(since)
                .fetch_all(&self.pool)
                .await?;

        ids.into_iter().map(to_warrior_id).collect()
    }

    async fn audit(&self, warrior_id: WarriorId) -> StoreResult<Option<AccountAudit>> {
        let row = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT a.warrior_id,
                   a.balance,
                   a.seed_balance,
                   COALESCE(SUM(e.amount), 0)::BIGINT AS entry_sum,
                   COUNT(e.id) AS entry_count,
                   (SELECT l.balance_after FROM ledger_entries l
                     WHERE l.warrior_id = a.warrior_id
                     ORDER BY l.id DESC LIMIT 1) AS last_balance_after
            FROM accounts a
            LEFT JOIN ledger_entries e ON e.warrior_id = a.warrior_id
            WHERE a.warrior_id = $1
            GROUP BY a.warrior_id, a.balance, a.seed_balance
            "#,
        )
        .bind(db_id(warrior_id)?)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(AccountAudit {
                warrior_id: to_warrior_id(row.warrior_id)?,
                balance: row.balance,
                seed_balance: row.seed_balance,
                entry_sum: row.entry_sum,
                entry_count: row.entry_count.max(0) as u64,
                last_balance_after: row.last_balance_after,
            })
        })
        .transpose()
    }

    async fn duplicate_keys(&self) -> StoreResult<Vec<DuplicateKey>> {
        let rows = sqlx::query_as::<_, (i64, String, i64)>(
            r#"
            SELECT warrior_id, idempotency_key, COUNT(*)
            FROM ledger_entries
            WHERE idempotency_key IS NOT NULL
            GROUP BY warrior_id, idempotency_key
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, key, occurrences)| {
                Ok(DuplicateKey {
                    warrior_id: to_warrior_id(id)?,
                    idempotency_key: key,
                    occurrences: occurrences.max(0) as u64,
                })
            })
            .collect()
    }

    async fn negative_balances(&self) -> StoreResult<Vec<(WarriorId, Coins)>> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT warrior_id, balance FROM accounts WHERE balance < 0",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, balance)| Ok((to_warrior_id(id)?, balance)))
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    locked: Vec<WarriorId>,
    appended: Vec<LedgerEntry>,
}

impl PgTx {
    fn ensure_locked(&self, warrior_id: WarriorId) -> StoreResult<()> {
        if self.locked.binary_search(&warrior_id).is_ok() {
            Ok(())
        } else {
            Err(StoreError::NotLocked(warrior_id))
        }
    }
}

#[async_trait]
impl AccountTx for PgTx {
    async fn account(&mut self, warrior_id: WarriorId) -> StoreResult<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
            .bind(db_id(warrior_id)?)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Account::try_from).transpose()
    }

    async fn entry_by_key(
        &mut self,
        warrior_id: WarriorId,
        key: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let row = sqlx::query_as::<_, EntryRow>(
            "SELECT * FROM ledger_entries WHERE warrior_id = $1 AND idempotency_key = $2",
        )
        .bind(db_id(warrior_id)?)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(LedgerEntry::try_from).transpose()
    }

    async fn set_balance(&mut self, warrior_id: WarriorId, balance: Coins) -> StoreResult<()> {
        self.ensure_locked(warrior_id)?;

        let result = sqlx::query(
            "UPDATE accounts SET balance = $1, updated_at = NOW() WHERE warrior_id = $2",
        )
        .bind(balance)
        .bind(db_id(warrior_id)?)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Constraint(format!(
                "account {} does not exist",
                warrior_id
            )));
        }
        Ok(())
    }

    async fn append_entries(&mut self, entries: Vec<NewLedgerEntry>) -> StoreResult<()> {
        for entry in entries {
            self.ensure_locked(entry.warrior_id)?;

            let row = sqlx::query_as::<_, EntryRow>(
                r#"
                INSERT INTO ledger_entries
                    (warrior_id, amount, kind, reason, balance_before, balance_after, idempotency_key, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                RETURNING *
                "#,
            )
            .bind(db_id(entry.warrior_id)?)
            .bind(entry.amount)
            .bind(entry.kind.as_str())
            .bind(&entry.reason)
            .bind(entry.balance_before)
            .bind(entry.balance_after)
            .bind(&entry.idempotency_key)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateEntry(entry.warrior_id)
                } else {
                    StoreError::from(e)
                }
            })?;

            self.appended.push(LedgerEntry::try_from(row)?);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<Vec<LedgerEntry>> {
        let PgTx { tx, appended, .. } = *self;
        tx.commit().await?;
        Ok(appended)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        let PgTx { tx, .. } = *self;
        tx.rollback().await?;
        Ok(())
    }
}
