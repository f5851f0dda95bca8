// Event router wiring - one JetStream partition consumer per subscribed topic

use coin_ledger::config::RouterConfig;
use coin_ledger::EventRouter;
use message_bus::{JetStreamSource, PartitionConsumer, RetryPolicy, SubscriberConfig, Topic};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Pause before a stopped consumer is rebound
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Bind every topic and spawn its consumer
///
/// Fails if any topic cannot be bound at boot; consumers already spawned stop
/// on the shutdown signal. After boot a consumer that stops for any reason
/// other than shutdown is rebound and restarted.
pub async fn spawn_partition_consumers(
    client: &async_nats::Client,
    subscriber: &SubscriberConfig,
    router_config: &RouterConfig,
    router: Arc<EventRouter>,
    shutdown: watch::Receiver<bool>,
) -> message_bus::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(Topic::ALL.len());

    for topic in Topic::ALL {
        let source = JetStreamSource::connect(client, subscriber, topic).await?;
        handles.push(tokio::spawn(run_forever(
            client.clone(),
            subscriber.clone(),
            topic,
            source,
            router.clone(),
            router_config.retry_policy(),
            shutdown.clone(),
        )));
    }

    info!("Event router consuming {} topics", handles.len());
    Ok(handles)
}

/// Keep one topic consumed until shutdown
async fn run_forever(
    client: async_nats::Client,
    subscriber: SubscriberConfig,
    topic: Topic,
    source: JetStreamSource,
    router: Arc<EventRouter>,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut source = Some(source);

    loop {
        if let Some(source) = source.take() {
            let consumer =
                PartitionConsumer::new(source, router.clone(), retry.clone(), shutdown.clone());
            match consumer.run().await {
                Ok(stats) => info!(
                    topic = %topic,
                    acked = stats.acked,
                    retries = stats.retries,
                    source_errors = stats.source_errors,
                    "Partition consumer stopped"
                ),
                Err(e) => error!(topic = %topic, "Partition consumer failed: {}", e),
            }
        }

        if *shutdown.borrow() {
            break;
        }

        warn!(topic = %topic, "Restarting partition consumer in {:?}", RESTART_DELAY);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }

        match JetStreamSource::connect(&client, &subscriber, topic).await {
            Ok(fresh) => source = Some(fresh),
            Err(e) => error!(topic = %topic, "Failed to rebind partition: {}", e),
        }
    }
}
