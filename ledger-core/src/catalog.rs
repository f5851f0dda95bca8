//! Warrior catalog
//!
//! Read-only view of the warrior directory. The ledger consults it to seed
//! an account the first time it sees a warrior and to price arena rewards.

use crate::error::LedgerError;
use crate::types::{Coins, WarriorId};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Warrior record as published by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarriorProfile {
    /// Warrior id
    pub id: WarriorId,
    /// Display name
    pub username: String,
    /// Combined power of the warrior's gear
    pub total_power: i64,
    /// Weapons owned
    pub weapon_count: u32,
    /// Balance a new account starts with
    pub coin_balance_seed: Coins,
}

/// Catalog lookup errors
#[derive(Error, Debug)]
pub enum CatalogError {
    /// Directory could not be reached or answered with a server error
    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    /// Directory answered with something that is not a warrior record
    #[error("Invalid catalog response: {0}")]
    InvalidResponse(String),
}

impl From<CatalogError> for LedgerError {
    fn from(err: CatalogError) -> Self {
        LedgerError::CatalogUnavailable(err.to_string())
    }
}

/// Lookup of warriors by id
#[async_trait]
pub trait WarriorCatalog: Send + Sync {
    /// Warrior record, or `None` when the directory does not know the id
    async fn get_warrior(&self, warrior_id: WarriorId) -> Result<Option<WarriorProfile>, CatalogError>;
}

/// Fixed in-process catalog
#[derive(Debug, Default)]
pub struct StaticCatalog {
    warriors: DashMap<WarriorId, WarriorProfile>,
}

impl StaticCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding warriors with the given seeds and no power
    pub fn with_seeds(seeds: impl IntoIterator<Item = (WarriorId, Coins)>) -> Self {
        let catalog = Self::new();
        for (id, seed) in seeds {
            catalog.insert(WarriorProfile {
                id,
                username: format!("warrior-{}", id),
                total_power: 0,
                weapon_count: 0,
                coin_balance_seed: seed,
            });
        }
        catalog
    }

    /// Add or replace a warrior
    pub fn insert(&self, profile: WarriorProfile) {
        self.warriors.insert(profile.id, profile);
    }

    /// Set a warrior's total power, creating a zero-seed record when absent
    pub fn set_power(&self, warrior_id: WarriorId, total_power: i64) {
        self.warriors
            .entry(warrior_id)
            .or_insert_with(|| WarriorProfile {
                id: warrior_id,
                username: format!("warrior-{}", warrior_id),
                total_power: 0,
                weapon_count: 0,
                coin_balance_seed: 0,
            })
            .total_power = total_power;
    }
}

#[async_trait]
impl WarriorCatalog for StaticCatalog {
    async fn get_warrior(&self, warrior_id: WarriorId) -> Result<Option<WarriorProfile>, CatalogError> {
        Ok(self.warriors.get(&warrior_id).map(|w| w.clone()))
    }
}
