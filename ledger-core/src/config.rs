//! Configuration for the ledger, router and reconciler

use crate::types::OverdraftPolicy;
use message_bus::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger core settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// History page size when the caller passes 0
    pub default_history_limit: u32,

    /// Upper bound on any history page
    pub max_history_limit: u32,

    /// Deadline for one operation (milliseconds)
    pub operation_timeout_ms: u64,

    /// Create unknown accounts from the warrior catalog on first touch
    pub seed_on_first_touch: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_history_limit: 50,
            max_history_limit: 500,
            operation_timeout_ms: 5_000,
            seed_on_first_touch: true,
        }
    }
}

impl LedgerConfig {
    /// Default operation deadline
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Effective page size for a requested limit
    pub fn history_limit(&self, requested: u32) -> u32 {
        let limit = if requested == 0 {
            self.default_history_limit
        } else {
            requested
        };
        limit.min(self.max_history_limit)
    }
}

/// Event router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Handling of event-driven debits that exceed the balance
    pub overdraft_policy: OverdraftPolicy,

    /// First retry delay for a halted partition (milliseconds)
    pub retry_initial_delay_ms: u64,

    /// Retry delay cap (milliseconds)
    pub retry_max_delay_ms: u64,

    /// Retry delay growth factor
    pub retry_backoff_multiplier: f64,

    /// Retry delay jitter fraction
    pub retry_jitter_factor: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            overdraft_policy: OverdraftPolicy::Reject,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
            retry_jitter_factor: 0.1,
        }
    }
}

impl RouterConfig {
    /// Backoff policy for partition consumers
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
            jitter_factor: self.retry_jitter_factor,
            max_retries: None,
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Sweep cadence (seconds)
    pub interval_secs: u64,

    /// Quarantine accounts whose balance disagrees with their ledger
    pub quarantine_on_mismatch: bool,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            quarantine_on_mismatch: true,
        }
    }
}

impl ReconciliationConfig {
    /// Sweep cadence
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
