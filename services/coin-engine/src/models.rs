use chrono::{DateTime, Utc};
use coin_ledger::{Coins, EntryKind, LedgerEntry, WarriorId};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Direct add or deduct request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct AmountRequest {
    pub amount: Coins,
    #[serde(default)]
    #[validate(length(max = 256))]
    pub reason: String,
}

/// Coin transfer request
#[derive(Debug, Deserialize, Serialize, Validate)]
pub struct TransferCoinsRequest {
    pub from_warrior_id: WarriorId,
    pub to_warrior_id: WarriorId,
    pub amount: Coins,
    #[serde(default)]
    #[validate(length(max = 256))]
    pub reason: String,
    #[validate(length(min = 1, max = 128))]
    pub idempotency_key: Option<String>,
}

/// History paging
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub warrior_id: WarriorId,
    pub balance: Coins,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddResponse {
    pub warrior_id: WarriorId,
    pub balance_before: Coins,
    pub balance: Coins,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeductResponse {
    pub success: bool,
    pub warrior_id: WarriorId,
    pub balance_before: Coins,
    pub balance_after: Coins,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransferResponse {
    pub success: bool,
    pub from_warrior_id: WarriorId,
    pub to_warrior_id: WarriorId,
    pub from_before: Coins,
    pub from_after: Coins,
    pub to_before: Coins,
    pub to_after: Coins,
    pub idempotency_key: Option<String>,
    pub message: String,
}

/// Ledger entry as returned by the history endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct EntryView {
    pub id: u64,
    pub warrior_id: WarriorId,
    pub amount: Coins,
    pub kind: EntryKind,
    pub reason: String,
    pub balance_before: Coins,
    pub balance_after: Coins,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for EntryView {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            id: entry.id,
            warrior_id: entry.warrior_id,
            amount: entry.amount,
            kind: entry.kind,
            reason: entry.reason,
            balance_before: entry.balance_before,
            balance_after: entry.balance_after,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub warrior_id: WarriorId,
    pub entries: Vec<EntryView>,
    pub total_count: u64,
    pub limit: u32,
    pub offset: u32,
}
