//! Bus envelope decoding
//!
//! Payloads are classified by their literal discriminator fields in a fixed
//! priority order. Only once a discriminator matches is the payload parsed
//! into that envelope, so a message can never fall through into a shape it
//! merely resembles.

use crate::types::{Coins, WarriorId};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Decode failures; both are permanent for the message
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Payload is not JSON
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Discriminator matched but the fields do not fit the envelope
    #[error("Malformed {envelope} envelope: {reason}")]
    Malformed {
        /// Envelope the discriminator selected
        envelope: &'static str,
        /// Field-level failure
        reason: String,
    },
}

/// Armory weapon sale
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WeaponPurchase {
    /// Weapon sold
    #[serde(deserialize_with = "id_string")]
    pub weapon_id: String,
    /// Buyer
    #[serde(deserialize_with = "warrior_id")]
    pub warrior_id: WarriorId,
    /// Price in coins
    pub weapon_price: Coins,
    /// Event time
    pub timestamp: Option<String>,
    /// Publishing service
    pub source_service: Option<String>,
}

/// Armory armor sale
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArmorPurchase {
    /// Armor sold
    #[serde(deserialize_with = "id_string")]
    pub armor_id: String,
    /// Buyer, interpreted according to `owner_type`
    #[serde(deserialize_with = "id_string")]
    pub buyer_id: String,
    /// Kind of buyer (`warrior`, `dragon`, `enemy`)
    #[serde(default = "default_owner_type")]
    pub owner_type: String,
    /// Price in coins
    pub price: Coins,
    /// Event time
    pub timestamp: Option<String>,
    /// Publishing service
    pub source_service: Option<String>,
}

/// Completed repair order, weapon or armor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepairOrder {
    /// Repair order
    #[serde(deserialize_with = "id_string")]
    pub order_id: String,
    /// Item owner, interpreted according to `owner_type`
    #[serde(deserialize_with = "id_string")]
    pub owner_id: String,
    /// Kind of owner
    #[serde(default = "default_owner_type")]
    pub owner_type: String,
    /// Repair cost after any upstream discount
    pub cost: Coins,
    /// Event time
    pub timestamp: Option<String>,
    /// Publishing service
    pub source_service: Option<String>,
}

/// Arena match result
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ArenaCompleted {
    /// Match
    #[serde(deserialize_with = "id_string")]
    pub match_id: String,
    /// Winner, credited with the reward
    #[serde(deserialize_with = "warrior_id")]
    pub winner_id: WarriorId,
    /// Loser, whose power prices the reward
    #[serde(deserialize_with = "warrior_id")]
    pub loser_id: WarriorId,
    /// Event time
    pub timestamp: Option<String>,
    /// Publishing service
    pub source_service: Option<String>,
}

/// Goblin coin theft
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GoblinTheft {
    /// Attacking goblin
    #[serde(deserialize_with = "id_string")]
    pub enemy_id: String,
    /// Victim
    #[serde(deserialize_with = "warrior_id")]
    pub warrior_id: WarriorId,
    /// Coins taken
    pub stolen_value: Coins,
    /// Attack time; part of the idempotency key
    pub timestamp: String,
    /// Publishing service
    pub source_service: Option<String>,
}

/// Battle wager settlement
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WagerResolved {
    /// Wager, when the publisher assigns one
    #[serde(default, deserialize_with = "opt_id_string")]
    pub wager_id: Option<String>,
    /// Battle the wager was placed on
    #[serde(default, deserialize_with = "opt_id_string")]
    pub match_id: Option<String>,
    /// Winning side's emperor, expected to be a warrior id
    #[serde(deserialize_with = "id_string")]
    pub winner_emperor_id: String,
    /// Coins paid out
    pub wager_amount: Coins,
    /// Event time
    pub timestamp: Option<String>,
    /// Publishing service
    pub source_service: Option<String>,
}

impl WagerResolved {
    /// Wager id, falling back to the match id
    pub fn reference(&self) -> Option<&str> {
        self.wager_id.as_deref().or(self.match_id.as_deref())
    }
}

/// Decoded bus message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// `event_type == "weapon_purchased"`
    WeaponPurchase(WeaponPurchase),
    /// `event_type == "armor_purchased"`
    ArmorPurchase(ArmorPurchase),
    /// `type == "weapon.repair"` with a positive cost
    WeaponRepair(RepairOrder),
    /// `type == "armor.repair"` with a positive cost
    ArmorRepair(RepairOrder),
    /// `event_type == "arena_match_completed"` with a winner
    ArenaCompleted(ArenaCompleted),
    /// `event_type == "enemy_attack"`, goblin coin steal
    GoblinTheft(GoblinTheft),
    /// `event_type == "battle_wager_resolved"` with a positive amount
    WagerResolved(WagerResolved),
    /// No discriminator matched
    Unrecognized,
}

impl Envelope {
    /// Label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Envelope::WeaponPurchase(_) => "weapon_purchase",
            Envelope::ArmorPurchase(_) => "armor_purchase",
            Envelope::WeaponRepair(_) => "weapon_repair",
            Envelope::ArmorRepair(_) => "armor_repair",
            Envelope::ArenaCompleted(_) => "arena_completed",
            Envelope::GoblinTheft(_) => "goblin_theft",
            Envelope::WagerResolved(_) => "wager_resolved",
            Envelope::Unrecognized => "unrecognized",
        }
    }
}

#[derive(Clone, Copy)]
enum Shape {
    WeaponPurchase,
    ArmorPurchase,
    WeaponRepair,
    ArmorRepair,
    ArenaCompleted,
    GoblinTheft,
    WagerResolved,
}

impl Shape {
    /// Priority order of the discriminator table
    const ORDER: [Shape; 7] = [
        Shape::WeaponPurchase,
        Shape::ArmorPurchase,
        Shape::WeaponRepair,
        Shape::ArmorRepair,
        Shape::ArenaCompleted,
        Shape::GoblinTheft,
        Shape::WagerResolved,
    ];

    fn matches(&self, fields: &Map<String, Value>) -> bool {
        let event_type = str_field(fields, "event_type");
        let kind = str_field(fields, "type");

        match self {
            Shape::WeaponPurchase => event_type == Some("weapon_purchased"),
            Shape::ArmorPurchase => event_type == Some("armor_purchased"),
            Shape::WeaponRepair => kind == Some("weapon.repair") && positive(fields, "cost"),
            Shape::ArmorRepair => kind == Some("armor.repair") && positive(fields, "cost"),
            Shape::ArenaCompleted => {
                event_type == Some("arena_match_completed") && present(fields, "winner_id")
            }
            Shape::GoblinTheft => {
                event_type == Some("enemy_attack")
                    && str_field(fields, "attack_type") == Some("coin_steal")
                    && str_field(fields, "enemy_type") == Some("goblin")
            }
            Shape::WagerResolved => {
                event_type == Some("battle_wager_resolved") && positive(fields, "wager_amount")
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Shape::WeaponPurchase => "weapon_purchase",
            Shape::ArmorPurchase => "armor_purchase",
            Shape::WeaponRepair => "weapon_repair",
            Shape::ArmorRepair => "armor_repair",
            Shape::ArenaCompleted => "arena_completed",
            Shape::GoblinTheft => "goblin_theft",
            Shape::WagerResolved => "wager_resolved",
        }
    }

    fn parse(&self, value: Value) -> Result<Envelope, serde_json::Error> {
        Ok(match self {
            Shape::WeaponPurchase => Envelope::WeaponPurchase(serde_json::from_value(value)?),
            Shape::ArmorPurchase => Envelope::ArmorPurchase(serde_json::from_value(value)?),
            Shape::WeaponRepair => Envelope::WeaponRepair(serde_json::from_value(value)?),
            Shape::ArmorRepair => Envelope::ArmorRepair(serde_json::from_value(value)?),
            Shape::ArenaCompleted => Envelope::ArenaCompleted(serde_json::from_value(value)?),
            Shape::GoblinTheft => Envelope::GoblinTheft(serde_json::from_value(value)?),
            Shape::WagerResolved => Envelope::WagerResolved(serde_json::from_value(value)?),
        })
    }
}

/// Classify and parse a payload
pub fn decode(payload: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Some(fields) = value.as_object() else {
        return Ok(Envelope::Unrecognized);
    };

    let Some(shape) = Shape::ORDER
        .iter()
        .copied()
        .find(|shape| shape.matches(fields))
    else {
        return Ok(Envelope::Unrecognized);
    };

    shape.parse(value).map_err(|e| DecodeError::Malformed {
        envelope: shape.name(),
        reason: e.to_string(),
    })
}

fn str_field<'a>(fields: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    fields.get(name).and_then(Value::as_str)
}

fn present(fields: &Map<String, Value>, name: &str) -> bool {
    fields.get(name).map_or(false, |v| !v.is_null())
}

fn positive(fields: &Map<String, Value>, name: &str) -> bool {
    fields
        .get(name)
        .and_then(Value::as_i64)
        .map_or(false, |n| n > 0)
}

fn default_owner_type() -> String {
    "warrior".to_string()
}

fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or numeric id, got {}",
            other
        ))),
    }
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected a string or numeric id, got {}",
            other
        ))),
    }
}

fn warrior_id<'de, D>(deserializer: D) -> Result<WarriorId, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| de::Error::custom(format!("invalid warrior id {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<WarriorId>()
            .map_err(|_| de::Error::custom(format!("invalid warrior id {:?}", s))),
        other => Err(de::Error::custom(format!("invalid warrior id {}", other))),
    }
}
