//! Metaphor Realm Coin Ledger
//!
//! Authoritative record of every warrior's coin balance. Balances change
//! only through the [`Ledger`], and every change appends an immutable
//! [`LedgerEntry`] in the same store transaction.
//!
//! # Architecture
//!
//! - **Storage**: Pluggable [`storage::LedgerStore`] with per-account locks (Postgres or in-memory)
//! - **Ledger**: Apply, transfer and history over that store
//! - **Router**: Bus events decoded into ledger commands, applied once per idempotency key
//! - **Reconciliation**: Periodic audit of balances against their ledgers
//!
//! # Invariants
//!
//! - Balance equals seed plus the sum of the account's entries
//! - Balances never go negative
//! - An idempotency key is applied at most once per warrior
//! - Entries are never modified or deleted

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod quarantine;
pub mod reconciliation;
pub mod router;
pub mod storage;
pub mod types;

// Re-exports
pub use context::LedgerContext;
pub use error::{LedgerError, Result, StoreError};
pub use ledger::Ledger;
pub use reconciliation::{Reconciler, ReconciliationReport};
pub use router::{EventRouter, RouteOutcome};
pub use types::{
    Account, ApplyOutcome, Coins, EntryKind, HistoryPage, LedgerCommand, LedgerEntry,
    Movement, OverdraftPolicy, TransferOutcome, TransferRequest, WarriorId,
};
