//! Type definitions for message bus

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topics the coin ledger subscribes to
///
/// Each topic is consumed as one FIFO partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    /// Weapon bought from the armory
    WeaponPurchase,
    /// Armor bought from the armory
    ArmorPurchase,
    /// Weapon repair order accepted
    WeaponRepair,
    /// Armor repair order accepted
    ArmorRepair,
    /// Arena match finished
    ArenaMatchCompleted,
    /// Enemy attacked a warrior
    EnemyAttack,
    /// Emperor battle wager settled
    BattleWagerResolved,
}

impl Topic {
    /// Every subscribed topic, in partition order
    pub const ALL: [Topic; 7] = [
        Topic::WeaponPurchase,
        Topic::ArmorPurchase,
        Topic::WeaponRepair,
        Topic::ArmorRepair,
        Topic::ArenaMatchCompleted,
        Topic::EnemyAttack,
        Topic::BattleWagerResolved,
    ];

    /// Topic name as used in consumer names and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            Topic::WeaponPurchase => "weapon-purchase",
            Topic::ArmorPurchase => "armor-purchase",
            Topic::WeaponRepair => "weapon-repair",
            Topic::ArmorRepair => "armor-repair",
            Topic::ArenaMatchCompleted => "arena-match-completed",
            Topic::EnemyAttack => "enemy-attack",
            Topic::BattleWagerResolved => "battle-wager-resolved",
        }
    }

    /// NATS subject carrying this topic
    pub fn subject(&self) -> &'static str {
        match self {
            Topic::WeaponPurchase => "weapon.purchase",
            Topic::ArmorPurchase => "armor.purchase",
            Topic::WeaponRepair => "weapon.repair",
            Topic::ArmorRepair => "armor.repair",
            Topic::ArenaMatchCompleted => "arena.match.completed",
            Topic::EnemyAttack => "enemy.attack",
            Topic::BattleWagerResolved => "battle.wager.resolved",
        }
    }

    /// Partition index of this topic
    pub fn partition(&self) -> u32 {
        match self {
            Topic::WeaponPurchase => 0,
            Topic::ArmorPurchase => 1,
            Topic::WeaponRepair => 2,
            Topic::ArmorRepair => 3,
            Topic::ArenaMatchCompleted => 4,
            Topic::EnemyAttack => 5,
            Topic::BattleWagerResolved => 6,
        }
    }

    /// Look a topic up by its name
    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
