//! Error types for the coin ledger

use crate::types::{Coins, WarriorId};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Result type for storage operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage engine errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient failure talking to the store
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Idempotency key already present for this warrior
    #[error("Duplicate ledger entry for warrior {0}")]
    DuplicateEntry(WarriorId),

    /// The accounts live in partitions that cannot share a transaction
    #[error("Accounts {0} and {1} cannot be locked together")]
    CrossPartition(WarriorId, WarriorId),

    /// Account was not locked by this transaction
    #[error("Account {0} is not part of this transaction")]
    NotLocked(WarriorId),

    /// Constraint violated by a write
    #[error("Constraint violated: {0}")]
    Constraint(String),

    /// Row could not be decoded
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // unique_violation
                Some("23505") => StoreError::Constraint(format!("unique: {}", db.message())),
                // check_violation
                Some("23514") => StoreError::Constraint(format!("check: {}", db.message())),
                _ => StoreError::Unavailable(err.to_string()),
            },
            sqlx::Error::RowNotFound => StoreError::Corrupt(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(Coins),

    /// Sender and receiver are the same warrior
    #[error("Invalid transfer: warrior {0} cannot transfer to itself")]
    InvalidTransfer(WarriorId),

    /// No account and no catalog record to seed one from
    #[error("Warrior not found: {0}")]
    NotFound(WarriorId),

    /// Balance would go below zero
    #[error("Insufficient funds for warrior {warrior_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Debited warrior
        warrior_id: WarriorId,
        /// Balance at the time of the debit
        balance: Coins,
        /// Amount requested
        requested: Coins,
    },

    /// Idempotency key already applied
    #[error("Duplicate entry for warrior {0}")]
    DuplicateEntry(WarriorId),

    /// Transient storage failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Deadline elapsed before commit
    #[error("Operation cancelled: deadline elapsed")]
    Cancelled,

    /// Account is quarantined by reconciliation
    #[error("Warrior {0} is quarantined")]
    Quarantined(WarriorId),

    /// Warrior catalog could not be reached
    #[error("Warrior catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// Transfer second leg failed and the reversing credit failed too
    #[error("Compensation failed for warrior {warrior_id}: {reason}")]
    CompensationFailed {
        /// Sender left debited
        warrior_id: WarriorId,
        /// Failure of the reversing credit
        reason: String,
    },

    /// Store returned data that breaks a ledger invariant
    #[error("Invariant violation: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Stable error class used in logs, metric labels and API bodies
    pub fn class(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InvalidTransfer(_) => "invalid_transfer",
            LedgerError::NotFound(_) => "not_found",
            LedgerError::InsufficientFunds { .. } => "insufficient_funds",
            LedgerError::DuplicateEntry(_) => "duplicate_entry",
            LedgerError::StoreUnavailable(_) => "store_unavailable",
            LedgerError::Cancelled => "cancelled",
            LedgerError::Quarantined(_) => "quarantined",
            LedgerError::CatalogUnavailable(_) => "catalog_unavailable",
            LedgerError::CompensationFailed { .. } => "compensation_failed",
            LedgerError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same request later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::StoreUnavailable(_)
                | LedgerError::Cancelled
                | LedgerError::Quarantined(_)
                | LedgerError::CatalogUnavailable(_)
        )
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => LedgerError::StoreUnavailable(msg),
            StoreError::DuplicateEntry(warrior_id) => LedgerError::DuplicateEntry(warrior_id),
            other => LedgerError::Internal(other.to_string()),
        }
    }
}
