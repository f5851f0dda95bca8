//! Write quarantine for accounts that failed reconciliation

use crate::types::WarriorId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Why and when an account was quarantined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    /// Account
    pub warrior_id: WarriorId,
    /// Integrity alarm that triggered the quarantine
    pub reason: String,
    /// When it was raised
    pub since: DateTime<Utc>,
}

/// Accounts barred from writes until an operator clears them
#[derive(Debug, Default)]
pub struct QuarantineRegistry {
    records: DashMap<WarriorId, QuarantineRecord>,
}

impl QuarantineRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantine an account; false when it already was
    pub fn quarantine(&self, warrior_id: WarriorId, reason: impl Into<String>) -> bool {
        let mut inserted = false;
        self.records.entry(warrior_id).or_insert_with(|| {
            inserted = true;
            QuarantineRecord {
                warrior_id,
                reason: reason.into(),
                since: Utc::now(),
            }
        });
        inserted
    }

    /// Whether writes to the account are barred
    pub fn is_quarantined(&self, warrior_id: WarriorId) -> bool {
        self.records.contains_key(&warrior_id)
    }

    /// Lift a quarantine; returns the cleared record
    pub fn clear(&self, warrior_id: WarriorId) -> Option<QuarantineRecord> {
        self.records.remove(&warrior_id).map(|(_, record)| record)
    }

    /// Current quarantines, ascending by warrior id
    pub fn list(&self) -> Vec<QuarantineRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.warrior_id);
        records
    }

    /// Number of quarantined accounts
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No account is quarantined
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
