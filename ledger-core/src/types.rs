//! Core types for the coin ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Stable warrior identifier
pub type WarriorId = u64;

/// Whole coins; there are no fractional units
pub type Coins = i64;

/// Closed set of reasons a balance can change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Operator credit through the command API
    DirectAdd,
    /// Operator debit through the command API
    DirectDeduct,
    /// One leg of a warrior-to-warrior transfer
    Transfer,
    /// Reversing credit after a failed cross-partition transfer
    TransferRollback,
    /// Weapon bought from the armory
    WeaponPurchase,
    /// Armor bought from the armory
    ArmorPurchase,
    /// Weapon repair order cost
    WeaponRepair,
    /// Armor repair order cost
    ArmorRepair,
    /// Healing session cost
    HealingCost,
    /// Coins stolen by a goblin
    GoblinTheft,
    /// Arena match reward
    ArenaVictory,
    /// Battle wager payout
    WagerReward,
}

impl EntryKind {
    /// Every kind, in declaration order
    pub const ALL: [EntryKind; 12] = [
        EntryKind::DirectAdd,
        EntryKind::DirectDeduct,
        EntryKind::Transfer,
        EntryKind::TransferRollback,
        EntryKind::WeaponPurchase,
        EntryKind::ArmorPurchase,
        EntryKind::WeaponRepair,
        EntryKind::ArmorRepair,
        EntryKind::HealingCost,
        EntryKind::GoblinTheft,
        EntryKind::ArenaVictory,
        EntryKind::WagerReward,
    ];

    /// Persisted tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::DirectAdd => "direct_add",
            EntryKind::DirectDeduct => "direct_deduct",
            EntryKind::Transfer => "transfer",
            EntryKind::TransferRollback => "transfer_rollback",
            EntryKind::WeaponPurchase => "weapon_purchase",
            EntryKind::ArmorPurchase => "armor_purchase",
            EntryKind::WeaponRepair => "weapon_repair",
            EntryKind::ArmorRepair => "armor_repair",
            EntryKind::HealingCost => "healing_cost",
            EntryKind::GoblinTheft => "goblin_theft",
            EntryKind::ArenaVictory => "arena_victory",
            EntryKind::WagerReward => "wager_reward",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entry kind: {}", s))
    }
}

/// Authoritative balance of one warrior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner
    pub warrior_id: WarriorId,
    /// Current balance, never negative once committed
    pub balance: Coins,
    /// Balance the account was created with
    pub seed_balance: Coins,
    /// First observation
    pub created_at: DateTime<Utc>,
    /// Last committed mutation
    pub updated_at: DateTime<Utc>,
}

/// Immutable record of one applied delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotone entry id, assigned at commit
    pub id: u64,
    /// Account the entry belongs to
    pub warrior_id: WarriorId,
    /// Signed delta: positive credit, negative debit
    pub amount: Coins,
    /// Economic reason
    pub kind: EntryKind,
    /// Free-form reason text
    pub reason: String,
    /// Balance before the delta
    pub balance_before: Coins,
    /// Balance after the delta
    pub balance_after: Coins,
    /// Unique per warrior when present
    pub idempotency_key: Option<String>,
    /// Commit time
    pub created_at: DateTime<Utc>,
}

/// Entry staged inside a transaction, before it has an id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    /// Account the entry belongs to
    pub warrior_id: WarriorId,
    /// Signed delta
    pub amount: Coins,
    /// Economic reason
    pub kind: EntryKind,
    /// Free-form reason text
    pub reason: String,
    /// Balance before the delta
    pub balance_before: Coins,
    /// Balance after the delta
    pub balance_after: Coins,
    /// Unique per warrior when present
    pub idempotency_key: Option<String>,
}

/// Direction and size of a balance change; amounts are always positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "direction", content = "amount")]
pub enum Movement {
    /// Increase the balance
    Credit(Coins),
    /// Decrease the balance
    Debit(Coins),
}

impl Movement {
    /// Requested amount, unsigned by convention
    pub fn amount(&self) -> Coins {
        match self {
            Movement::Credit(amount) | Movement::Debit(amount) => *amount,
        }
    }

    /// Signed delta the movement applies
    pub fn delta(&self) -> Coins {
        match self {
            Movement::Credit(amount) => *amount,
            Movement::Debit(amount) => -*amount,
        }
    }
}

/// How a debit larger than the balance is handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdraftPolicy {
    /// Fail with insufficient funds
    #[default]
    Reject,
    /// Debit whatever is left, down to zero
    Clamp,
}

/// Single-account mutation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommand {
    /// Target account
    pub warrior_id: WarriorId,
    /// Credit or debit
    pub movement: Movement,
    /// Economic reason
    pub kind: EntryKind,
    /// Free-form reason text
    pub reason: String,
    /// Replay guard; event-routed commands always carry one
    pub idempotency_key: Option<String>,
    /// Overdraft handling for debits
    pub overdraft: OverdraftPolicy,
    /// Deadline override
    pub timeout: Option<Duration>,
}

impl LedgerCommand {
    /// Credit command
    pub fn credit(
        warrior_id: WarriorId,
        amount: Coins,
        kind: EntryKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(warrior_id, Movement::Credit(amount), kind, reason)
    }

    /// Debit command
    pub fn debit(
        warrior_id: WarriorId,
        amount: Coins,
        kind: EntryKind,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(warrior_id, Movement::Debit(amount), kind, reason)
    }

    fn new(warrior_id: WarriorId, movement: Movement, kind: EntryKind, reason: impl Into<String>) -> Self {
        Self {
            warrior_id,
            movement,
            kind,
            reason: reason.into(),
            idempotency_key: None,
            overdraft: OverdraftPolicy::Reject,
            timeout: None,
        }
    }

    /// Attach an idempotency key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the overdraft policy
    pub fn with_overdraft(mut self, policy: OverdraftPolicy) -> Self {
        self.overdraft = policy;
        self
    }

    /// Set the deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of an apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Target account
    pub warrior_id: WarriorId,
    /// Entry written, or the one found on replay
    pub entry_id: u64,
    /// Balance before the delta
    pub balance_before: Coins,
    /// Balance after the delta
    pub balance_after: Coins,
    /// Delta actually applied (differs from the request when clamped)
    pub applied: Coins,
    /// The idempotency key had already been applied
    pub replayed: bool,
}

/// Two-account transfer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Sender
    pub from: WarriorId,
    /// Receiver
    pub to: WarriorId,
    /// Positive amount
    pub amount: Coins,
    /// Kind tagged on both legs
    pub kind: EntryKind,
    /// Reason text, prefixed per leg
    pub reason: String,
    /// Base key for the derived leg keys
    pub idempotency_key: Option<String>,
    /// Deadline override
    pub timeout: Option<Duration>,
}

impl TransferRequest {
    /// Plain warrior-to-warrior transfer
    pub fn new(from: WarriorId, to: WarriorId, amount: Coins, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            amount,
            kind: EntryKind::Transfer,
            reason: reason.into(),
            idempotency_key: None,
            timeout: None,
        }
    }

    /// Attach a base idempotency key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Result of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    /// Sender balance before
    pub from_before: Coins,
    /// Sender balance after
    pub from_after: Coins,
    /// Receiver balance before
    pub to_before: Coins,
    /// Receiver balance after
    pub to_after: Coins,
    /// Base key the leg keys derive from
    pub idempotency_key: String,
    /// Both legs had already been applied
    pub replayed: bool,
}

/// Page of history, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPage {
    /// Account
    pub warrior_id: WarriorId,
    /// Entries, strictly descending by id
    pub entries: Vec<LedgerEntry>,
    /// Entries the account has in total
    pub total_count: u64,
    /// Effective limit
    pub limit: u32,
    /// Offset requested
    pub offset: u32,
}
