//! Bus-driven ledger updates through a partition consumer

use coin_ledger::{
    catalog::StaticCatalog,
    config::{LedgerConfig, ReconciliationConfig, RouterConfig},
    metrics::Metrics,
    storage::MemoryStore,
    EntryKind, EventRouter, Ledger, LedgerContext, Reconciler,
};
use message_bus::{channel, PartitionConsumer, RetryPolicy, Topic};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        max_retries: Some(10),
    }
}

fn setup(store: MemoryStore, catalog: StaticCatalog) -> (Ledger, Arc<EventRouter>) {
    let ctx = LedgerContext::new(
        Arc::new(store),
        Arc::new(catalog),
        Arc::new(Metrics::new().unwrap()),
    );
    let ledger = Ledger::new(ctx, LedgerConfig::default());
    let router = Arc::new(EventRouter::new(ledger.clone(), RouterConfig::default()));
    (ledger, router)
}

#[tokio::test]
async fn test_weapon_purchase_replayed_three_times() {
    let (ledger, router) = setup(MemoryStore::new(), StaticCatalog::with_seeds([(1, 1000)]));
    let (publisher, source) = channel(Topic::WeaponPurchase);
    let offsets = source.offsets();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let event = json!({
        "event_type": "weapon_purchased",
        "weapon_id": "W1",
        "warrior_id": 1,
        "weapon_price": 400
    });
    for _ in 0..3 {
        publisher.publish_json(&event).unwrap();
    }
    drop(publisher);

    let stats = PartitionConsumer::new(source, router, fast_retry(), shutdown_rx)
        .run()
        .await
        .unwrap();
    assert_eq!(stats.acked, 3);
    assert_eq!(offsets.committed(), 3);

    assert_eq!(ledger.balance(1).await.unwrap(), 600);
    let entries = ledger.history(1, 0, 0).await.unwrap().entries;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::WeaponPurchase);
    assert_eq!(entries[0].amount, -400);
}

#[tokio::test]
async fn test_store_outage_holds_partition_until_recovery() {
    let store = MemoryStore::new();
    let (ledger, router) = setup(store.clone(), StaticCatalog::with_seeds([(1, 100)]));
    ledger.balance(1).await.unwrap();

    let (publisher, source) = channel(Topic::ArmorRepair);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    publisher
        .publish_json(&json!({
            "type": "armor.repair", "order_id": "r-1", "owner_id": "1",
            "owner_type": "warrior", "cost": 30
        }))
        .unwrap();
    publisher
        .publish_json(&json!({
            "type": "armor.repair", "order_id": "r-2", "owner_id": "1",
            "owner_type": "warrior", "cost": 20
        }))
        .unwrap();
    drop(publisher);

    store.fail_next(2);
    let stats = PartitionConsumer::new(source, router, fast_retry(), shutdown_rx)
        .run()
        .await
        .unwrap();
    assert_eq!(stats.acked, 2);
    assert_eq!(stats.retries, 2);

    // Both orders applied in publish order
    let entries = ledger.history(1, 0, 0).await.unwrap().entries;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].amount, -30);
    assert_eq!(entries[0].amount, -20);
    assert_eq!(ledger.balance(1).await.unwrap(), 50);
}

#[tokio::test]
async fn test_poison_message_does_not_stall_partition() {
    let (ledger, router) = setup(MemoryStore::new(), StaticCatalog::with_seeds([(1, 100)]));
    let (publisher, source) = channel(Topic::WeaponPurchase);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    publisher.publish(&b"not json"[..]);
    publisher
        .publish_json(&json!({"event_type": "weapon_purchased", "weapon_id": 9}))
        .unwrap();
    publisher
        .publish_json(&json!({
            "event_type": "weapon_purchased", "weapon_id": "W2",
            "warrior_id": "1", "weapon_price": 500
        }))
        .unwrap();
    publisher
        .publish_json(&json!({
            "event_type": "weapon_purchased", "weapon_id": "W3",
            "warrior_id": 1, "weapon_price": 60
        }))
        .unwrap();
    drop(publisher);

    let stats = PartitionConsumer::new(source, router, fast_retry(), shutdown_rx)
        .run()
        .await
        .unwrap();
    assert_eq!(stats.acked, 4);
    assert_eq!(stats.retries, 0);

    // The unaffordable purchase is acknowledged and skipped
    assert_eq!(ledger.balance(1).await.unwrap(), 40);
}

#[tokio::test]
async fn test_quarantined_account_halts_partition_until_cleared() {
    let store = MemoryStore::new();
    let (ledger, router) = setup(store.clone(), StaticCatalog::with_seeds([(1, 1000)]));
    ledger.add(1, 10, "bonus").await.unwrap();
    store.force_balance(1, 5);

    let reconciler = Arc::new(Reconciler::new(
        ledger.context().clone(),
        ReconciliationConfig::default(),
    ));
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.newly_quarantined, vec![1]);

    let (publisher, source) = channel(Topic::WeaponPurchase);
    let offsets = source.offsets();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    publisher
        .publish_json(&json!({
            "event_type": "weapon_purchased", "weapon_id": "W5",
            "warrior_id": 1, "weapon_price": 5
        }))
        .unwrap();
    drop(publisher);

    let retry = RetryPolicy {
        max_retries: None,
        ..fast_retry()
    };
    let consumer = tokio::spawn(PartitionConsumer::new(source, router, retry, shutdown_rx).run());

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(offsets.committed(), 0);

    reconciler.clear_quarantine(1);
    let stats = consumer.await.unwrap().unwrap();
    assert_eq!(stats.acked, 1);
    assert!(stats.retries > 0);
    assert_eq!(offsets.committed(), 1);
    assert_eq!(ledger.balance(1).await.unwrap(), 0);
}
