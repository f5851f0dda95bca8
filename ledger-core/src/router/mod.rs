//! Event router
//!
//! Consumes bus partitions, decodes each message into a typed envelope and
//! applies the matching ledger command exactly once per idempotency key.

mod dispatch;
mod envelope;

pub use dispatch::{arena_reward, EventRouter, Plan, RouteOutcome};
pub use envelope::{
    decode, ArenaCompleted, ArmorPurchase, DecodeError, Envelope, GoblinTheft, RepairOrder,
    WagerResolved, WeaponPurchase,
};
