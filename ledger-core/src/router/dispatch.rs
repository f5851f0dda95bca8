//! Event dispatch
//!
//! Turns each decoded envelope into at most one ledger command and maps the
//! ledger's answer onto a consumer disposition. Only transient failures hold
//! the partition; everything else is acknowledged so one bad event cannot
//! stall the topic.

use super::envelope::{decode, DecodeError, Envelope, RepairOrder};
use crate::{
    catalog::WarriorProfile,
    config::RouterConfig,
    error::LedgerError,
    ledger::Ledger,
    types::{ApplyOutcome, Coins, EntryKind, LedgerCommand, OverdraftPolicy, WarriorId},
};
use async_trait::async_trait;
use message_bus::{BusMessage, Disposition, MessageHandler};
use tracing::{debug, error, info, warn};

const WARRIOR_OWNER: &str = "warrior";

/// What a decoded envelope asks of the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Apply this command
    Apply(LedgerCommand),
    /// Acknowledge without touching the ledger
    Skip(&'static str),
}

/// Result of routing one payload
#[derive(Debug)]
pub enum RouteOutcome {
    /// Ledger entry written
    Applied(ApplyOutcome),
    /// Idempotency key already applied
    Replayed(ApplyOutcome),
    /// Envelope needs no ledger change
    Skipped(&'static str),
    /// No discriminator matched
    Unrecognized,
    /// Payload could not be decoded
    Undecodable(DecodeError),
    /// Ledger refused the command
    Rejected(LedgerError),
}

impl RouteOutcome {
    /// Consumer disposition for this outcome
    pub fn disposition(&self) -> Disposition {
        match self {
            RouteOutcome::Rejected(err) if err.is_transient() => Disposition::Retry,
            _ => Disposition::Ack,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            RouteOutcome::Applied(_) => "applied",
            RouteOutcome::Replayed(_) => "replayed",
            RouteOutcome::Skipped(_) => "skipped",
            RouteOutcome::Unrecognized => "unrecognized",
            RouteOutcome::Undecodable(_) => "undecodable",
            RouteOutcome::Rejected(err) => err.class(),
        }
    }
}

/// Arena reward for beating `loser`
pub fn arena_reward(loser: &WarriorProfile) -> Coins {
    loser.total_power
}

/// Bus handler feeding the ledger
#[derive(Debug, Clone)]
pub struct EventRouter {
    ledger: Ledger,
    config: RouterConfig,
}

impl EventRouter {
    /// Create a router over `ledger`
    pub fn new(ledger: Ledger, config: RouterConfig) -> Self {
        Self { ledger, config }
    }

    /// Decode, plan and apply one payload
    pub async fn route(&self, payload: &[u8]) -> RouteOutcome {
        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "Undecodable event skipped");
                self.ledger
                    .context()
                    .metrics
                    .record_event("undecodable", "undecodable");
                return RouteOutcome::Undecodable(err);
            }
        };

        let name = envelope.name();
        let outcome = self.route_envelope(envelope).await;
        self.ledger
            .context()
            .metrics
            .record_event(name, outcome.label());
        outcome
    }

    async fn route_envelope(&self, envelope: Envelope) -> RouteOutcome {
        let name = envelope.name();
        if envelope == Envelope::Unrecognized {
            debug!("Unrecognized event acknowledged");
            return RouteOutcome::Unrecognized;
        }

        let cmd = match self.plan(&envelope).await {
            Ok(Plan::Apply(cmd)) => cmd,
            Ok(Plan::Skip(reason)) => {
                info!(envelope = name, reason, "Event skipped");
                return RouteOutcome::Skipped(reason);
            }
            Err(err) => return self.rejected(name, err),
        };

        match self.ledger.apply(cmd).await {
            Ok(outcome) if outcome.replayed => {
                debug!(envelope = name, warrior_id = outcome.warrior_id, "Event already applied");
                RouteOutcome::Replayed(outcome)
            }
            Ok(outcome) => RouteOutcome::Applied(outcome),
            Err(err) => self.rejected(name, err),
        }
    }

    fn rejected(&self, envelope: &'static str, err: LedgerError) -> RouteOutcome {
        match &err {
            err if err.is_transient() => {
                warn!(envelope, class = err.class(), "Transient failure, partition halted");
            }
            LedgerError::DuplicateEntry(_) => {
                debug!(envelope, "Duplicate event acknowledged");
            }
            LedgerError::InsufficientFunds {
                warrior_id,
                balance,
                requested,
            } => {
                warn!(
                    envelope,
                    warrior_id,
                    balance,
                    requested,
                    "Event debit exceeds balance, acknowledged without applying"
                );
            }
            LedgerError::Internal(_) | LedgerError::CompensationFailed { .. } => {
                error!(envelope, class = err.class(), "Event dropped on ledger fault");
            }
            _ => {
                warn!(envelope, class = err.class(), "Event rejected");
            }
        }
        RouteOutcome::Rejected(err)
    }

    /// Command for a decoded envelope
    pub async fn plan(&self, envelope: &Envelope) -> Result<Plan, LedgerError> {
        let event_debit = self.config.overdraft_policy;

        let plan = match envelope {
            Envelope::WeaponPurchase(e) => Plan::Apply(
                LedgerCommand::debit(
                    e.warrior_id,
                    e.weapon_price,
                    EntryKind::WeaponPurchase,
                    format!("weapon purchase {}", e.weapon_id),
                )
                .with_key(format!("wpn:{}:{}", e.weapon_id, e.warrior_id)),
            ),

            Envelope::ArmorPurchase(e) => {
                if e.owner_type != WARRIOR_OWNER {
                    return Ok(Plan::Skip("armor bought by a non-warrior owner"));
                }
                let Some(buyer) = parse_warrior(&e.buyer_id) else {
                    return Ok(Plan::Skip("armor buyer id is not a warrior id"));
                };
                Plan::Apply(
                    LedgerCommand::debit(
                        buyer,
                        e.price,
                        EntryKind::ArmorPurchase,
                        format!("armor purchase {}", e.armor_id),
                    )
                    .with_key(format!("arm:{}:{}", e.armor_id, e.buyer_id)),
                )
            }

            Envelope::WeaponRepair(order) => {
                repair_plan(order, EntryKind::WeaponRepair, "wrep", event_debit)
            }
            Envelope::ArmorRepair(order) => {
                repair_plan(order, EntryKind::ArmorRepair, "arep", event_debit)
            }

            Envelope::ArenaCompleted(e) => {
                let loser = self
                    .ledger
                    .context()
                    .catalog
                    .get_warrior(e.loser_id)
                    .await?
                    .ok_or(LedgerError::NotFound(e.loser_id))?;

                Plan::Apply(
                    LedgerCommand::credit(
                        e.winner_id,
                        arena_reward(&loser),
                        EntryKind::ArenaVictory,
                        format!("arena victory over {} in match {}", e.loser_id, e.match_id),
                    )
                    .with_key(format!("arena:{}", e.match_id)),
                )
            }

            Envelope::GoblinTheft(e) => Plan::Apply(
                LedgerCommand::debit(
                    e.warrior_id,
                    e.stolen_value,
                    EntryKind::GoblinTheft,
                    format!("coins stolen by goblin {}", e.enemy_id),
                )
                .with_key(format!("gob:{}:{}:{}", e.enemy_id, e.warrior_id, e.timestamp))
                .with_overdraft(event_debit),
            ),

            Envelope::WagerResolved(e) => {
                let Some(reference) = e.reference() else {
                    return Ok(Plan::Skip("wager without wager or match id"));
                };
                let Some(emperor) = parse_warrior(&e.winner_emperor_id) else {
                    warn!(
                        amount = e.wager_amount,
                        kind = %EntryKind::WagerReward,
                        class = "invalid_warrior_id",
                        "Wager winner is not a warrior id, event dropped"
                    );
                    return Ok(Plan::Skip("wager winner is not a warrior id"));
                };
                Plan::Apply(
                    LedgerCommand::credit(
                        emperor,
                        e.wager_amount,
                        EntryKind::WagerReward,
                        format!("wager reward {}", reference),
                    )
                    .with_key(format!("wgr:{}", reference)),
                )
            }

            Envelope::Unrecognized => Plan::Skip("unrecognized event"),
        };

        Ok(plan)
    }
}

fn repair_plan(
    order: &RepairOrder,
    kind: EntryKind,
    prefix: &str,
    overdraft: OverdraftPolicy,
) -> Plan {
    if order.owner_type != WARRIOR_OWNER {
        return Plan::Skip("repair for a non-warrior owner");
    }
    let Some(owner) = parse_warrior(&order.owner_id) else {
        return Plan::Skip("repair owner id is not a warrior id");
    };
    Plan::Apply(
        LedgerCommand::debit(owner, order.cost, kind, format!("repair order {}", order.order_id))
            .with_key(format!("{}:{}", prefix, order.order_id))
            .with_overdraft(overdraft),
    )
}

fn parse_warrior(raw: &str) -> Option<WarriorId> {
    raw.trim().parse().ok()
}

#[async_trait]
impl MessageHandler for EventRouter {
    async fn handle(&self, message: &BusMessage) -> Disposition {
        let outcome = self.route(&message.payload).await;
        let disposition = outcome.disposition();
        debug!(
            topic = %message.topic,
            offset = message.offset,
            outcome = outcome.label(),
            "Event handled"
        );
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::config::LedgerConfig;
    use crate::context::LedgerContext;
    use crate::metrics::Metrics;
    use crate::storage::MemoryStore;
    use crate::types::Movement;
    use serde_json::json;
    use std::sync::Arc;

    fn router(seeds: &[(WarriorId, Coins)]) -> EventRouter {
        let ctx = LedgerContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(StaticCatalog::with_seeds(seeds.iter().copied())),
            Arc::new(Metrics::new().unwrap()),
        );
        EventRouter::new(
            Ledger::new(ctx, LedgerConfig::default()),
            RouterConfig::default(),
        )
    }

    async fn plan_for(router: &EventRouter, value: serde_json::Value) -> Plan {
        let envelope = decode(value.to_string().as_bytes()).unwrap();
        router.plan(&envelope).await.unwrap()
    }

    #[tokio::test]
    async fn test_idempotency_keys() {
        let router = router(&[]);

        let Plan::Apply(cmd) = plan_for(&router, json!({
            "event_type": "weapon_purchased", "weapon_id": "W1", "warrior_id": 1, "weapon_price": 400
        }))
        .await
        else {
            panic!("expected apply");
        };
        assert_eq!(cmd.idempotency_key.as_deref(), Some("wpn:W1:1"));
        assert_eq!(cmd.movement, Movement::Debit(400));

        let Plan::Apply(cmd) = plan_for(&router, json!({
            "type": "weapon.repair", "order_id": "r-5", "owner_id": "8", "owner_type": "warrior", "cost": 30
        }))
        .await
        else {
            panic!("expected apply");
        };
        assert_eq!(cmd.idempotency_key.as_deref(), Some("wrep:r-5"));
        assert_eq!(cmd.warrior_id, 8);

        let Plan::Apply(cmd) = plan_for(&router, json!({
            "event_type": "enemy_attack", "attack_type": "coin_steal", "enemy_type": "goblin",
            "enemy_id": "g7", "warrior_id": 2, "stolen_value": 15, "timestamp": "2024-05-01T10:00:00Z"
        }))
        .await
        else {
            panic!("expected apply");
        };
        assert_eq!(
            cmd.idempotency_key.as_deref(),
            Some("gob:g7:2:2024-05-01T10:00:00Z")
        );
        assert_eq!(cmd.kind, EntryKind::GoblinTheft);

        let Plan::Apply(cmd) = plan_for(&router, json!({
            "event_type": "battle_wager_resolved", "wager_id": "wg-1", "match_id": "m-1",
            "winner_emperor_id": "6", "wager_amount": 90
        }))
        .await
        else {
            panic!("expected apply");
        };
        assert_eq!(cmd.idempotency_key.as_deref(), Some("wgr:wg-1"));
        assert_eq!(cmd.movement, Movement::Credit(90));
    }

    #[tokio::test]
    async fn test_non_warrior_owners_skipped() {
        let router = router(&[]);

        let plan = plan_for(&router, json!({
            "event_type": "armor_purchased", "armor_id": "A1", "buyer_id": "d-3",
            "owner_type": "dragon", "price": 100
        }))
        .await;
        assert!(matches!(plan, Plan::Skip(_)));

        let plan = plan_for(&router, json!({
            "type": "armor.repair", "order_id": "o1", "owner_id": "e-1",
            "owner_type": "enemy", "cost": 20
        }))
        .await;
        assert!(matches!(plan, Plan::Skip(_)));
    }

    #[tokio::test]
    async fn test_unparseable_emperor_dropped() {
        let logs = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let logs = logs.clone();
                move || CapturedLogs(logs.clone())
            })
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let router = router(&[]);
        let plan = plan_for(&router, json!({
            "event_type": "battle_wager_resolved", "match_id": "m-secret-2",
            "winner_emperor_id": "emperor-of-dusk", "wager_amount": 50
        }))
        .await;
        assert_eq!(plan, Plan::Skip("wager winner is not a warrior id"));

        // Rejection logs carry amount, kind and class but no key material
        let output = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(output.contains("amount=50"));
        assert!(output.contains("class=\"invalid_warrior_id\""));
        assert!(!output.contains("m-secret-2"));
    }

    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_arena_reward_is_loser_power() {
        let catalog = StaticCatalog::with_seeds([(1, 100), (2, 50)]);
        catalog.set_power(2, 340);
        let ctx = LedgerContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(catalog),
            Arc::new(Metrics::new().unwrap()),
        );
        let router = EventRouter::new(
            Ledger::new(ctx, LedgerConfig::default()),
            RouterConfig::default(),
        );

        let outcome = router
            .route(json!({
                "event_type": "arena_match_completed", "match_id": "m-3",
                "winner_id": 1, "loser_id": 2
            })
            .to_string()
            .as_bytes())
            .await;

        let RouteOutcome::Applied(applied) = outcome else {
            panic!("expected applied, got {:?}", outcome);
        };
        assert_eq!(applied.balance_after, 440);
    }

    #[tokio::test]
    async fn test_dispositions() {
        let router = router(&[(1, 100)]);

        let unknown = router.route(br#"{"event_type":"dragon_hatched"}"#).await;
        assert!(matches!(unknown, RouteOutcome::Unrecognized));
        assert_eq!(unknown.disposition(), Disposition::Ack);

        let garbage = router.route(b"\xff\xfe").await;
        assert!(matches!(garbage, RouteOutcome::Undecodable(_)));
        assert_eq!(garbage.disposition(), Disposition::Ack);

        let overdraft = router
            .route(br#"{"event_type":"weapon_purchased","weapon_id":"W9","warrior_id":1,"weapon_price":500}"#)
            .await;
        assert!(matches!(
            overdraft,
            RouteOutcome::Rejected(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(overdraft.disposition(), Disposition::Ack);

        let transient = RouteOutcome::Rejected(LedgerError::StoreUnavailable("down".into()));
        assert_eq!(transient.disposition(), Disposition::Retry);
        assert_eq!(
            RouteOutcome::Rejected(LedgerError::Quarantined(1)).disposition(),
            Disposition::Retry
        );
    }
}
