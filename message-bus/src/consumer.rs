//! Partition consumer
//!
//! Processes one partition strictly in order: a message is acknowledged only
//! after its handler returns [`Disposition::Ack`]. A [`Disposition::Retry`]
//! halts the partition and re-runs the same message after an exponential
//! backoff, so later messages never overtake an unfinished one.
//!
//! Source failures (a dropped connection, a missed heartbeat) are logged and
//! the read is retried with the same backoff. A failed ack is logged and
//! left to redelivery.

use crate::{
    message::BusMessage,
    metrics::{
        MESSAGE_PROCESS_DURATION, MESSAGE_RECEIVE_TOTAL, MESSAGE_RETRY_TOTAL, SOURCE_ERROR_TOTAL,
    },
    source::MessageSource,
    Error, Result,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What the consumer should do with a handled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Advance the offset past the message
    Ack,
    /// Transient failure: keep the offset and try the message again
    Retry,
}

impl Disposition {
    fn as_label(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Retry => "retry",
        }
    }
}

/// Message handler trait
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle incoming message
    async fn handle(&self, message: &BusMessage) -> Disposition;
}

/// Exponential backoff with jitter for halted partitions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomised in both directions
    pub jitter_factor: f64,
    /// Give up after this many retries; `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_retries, Some(max) if attempt >= max)
    }
}

/// Counters returned when a consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages acknowledged
    pub acked: u64,
    /// Retries performed
    pub retries: u64,
    /// Failed reads or acks that the consumer rode out
    pub source_errors: u64,
}

/// Single-worker consumer of one partition
pub struct PartitionConsumer<S, H> {
    source: S,
    handler: Arc<H>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl<S, H> PartitionConsumer<S, H>
where
    S: MessageSource,
    H: MessageHandler + 'static,
{
    /// Create new consumer
    pub fn new(source: S, handler: Arc<H>, retry: RetryPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            source,
            handler,
            retry,
            shutdown,
        }
    }

    /// Consume until the partition closes or shutdown is signalled
    pub async fn run(mut self) -> Result<ConsumerStats> {
        let mut stats = ConsumerStats::default();
        let mut read_failures = 0u32;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = self.shutdown.changed() => break,
                next = self.source.next() => next,
            };

            let next = match next {
                Ok(next) => {
                    read_failures = 0;
                    next
                }
                Err(e) => {
                    let delay = self.retry.delay(read_failures);
                    read_failures = read_failures.saturating_add(1);
                    stats.source_errors += 1;
                    SOURCE_ERROR_TOTAL.with_label_values(&["receive"]).inc();
                    warn!("Error receiving message: {}, retrying in {:?}", e, delay);

                    tokio::select! {
                        _ = self.shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            let Some(message) = next else {
                info!("Partition closed after {} messages", stats.acked);
                break;
            };

            if !self.process(&message, &mut stats).await? {
                break;
            }
        }

        Ok(stats)
    }

    /// Run one message to an ack; false when shutdown interrupted the retries
    async fn process(&mut self, message: &BusMessage, stats: &mut ConsumerStats) -> Result<bool> {
        let mut attempt = 0u32;

        loop {
            let start = Instant::now();
            let disposition = self.handler.handle(message).await;

            MESSAGE_RECEIVE_TOTAL
                .with_label_values(&[message.topic.as_str(), disposition.as_label()])
                .inc();
            MESSAGE_PROCESS_DURATION
                .with_label_values(&[message.topic.as_str()])
                .observe(start.elapsed().as_secs_f64());

            match disposition {
                Disposition::Ack => {
                    match self.source.ack(message).await {
                        Ok(()) => {
                            stats.acked += 1;
                            debug!(topic = %message.topic, offset = message.offset, "Offset advanced");
                        }
                        Err(e) => {
                            // The handler already applied it; redelivery replays by key
                            stats.source_errors += 1;
                            SOURCE_ERROR_TOTAL.with_label_values(&["ack"]).inc();
                            warn!(
                                topic = %message.topic,
                                offset = message.offset,
                                "Failed to ack message: {}",
                                e
                            );
                        }
                    }
                    return Ok(true);
                }
                Disposition::Retry => {
                    if self.retry.exhausted(attempt) {
                        return Err(Error::RetriesExhausted {
                            topic: message.topic.clone(),
                            offset: message.offset,
                        });
                    }

                    let delay = self.retry.delay(attempt);
                    attempt += 1;
                    stats.retries += 1;
                    MESSAGE_RETRY_TOTAL
                        .with_label_values(&[message.topic.as_str()])
                        .inc();
                    warn!(
                        topic = %message.topic,
                        offset = message.offset,
                        attempt,
                        "Partition halted on transient failure, retrying in {:?}",
                        delay
                    );

                    if let Err(e) = self.source.in_progress(message).await {
                        debug!(topic = %message.topic, "Failed to extend ack deadline: {}", e);
                    }

                    tokio::select! {
                        _ = self.shutdown.changed() => return Ok(false),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{channel, ChannelSource};
    use crate::types::Topic;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    struct Recording {
        seen: Mutex<Vec<u64>>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl MessageHandler for Recording {
        async fn handle(&self, message: &BusMessage) -> Disposition {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Disposition::Retry;
            }
            self.seen.lock().await.push(message.offset);
            Disposition::Ack
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(1600));
        assert_eq!(policy.delay(20), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_processes_in_order_and_acks() {
        let (publisher, source) = channel(Topic::ArmorRepair);
        let offsets = source.offsets();
        for i in 0..5 {
            publisher.publish(format!("{{\"n\":{i}}}"));
        }
        drop(publisher);

        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
        });
        let (_tx, rx) = watch::channel(false);
        let stats = PartitionConsumer::new(source, handler.clone(), fast_retry(), rx)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.acked, 5);
        assert_eq!(*handler.seen.lock().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(offsets.committed(), 5);
    }

    #[tokio::test]
    async fn test_retry_holds_offset_until_success() {
        let (publisher, source) = channel(Topic::EnemyAttack);
        let offsets = source.offsets();
        publisher.publish("first");
        publisher.publish("second");
        drop(publisher);

        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(3),
        });
        let (_tx, rx) = watch::channel(false);
        let stats = PartitionConsumer::new(source, handler.clone(), fast_retry(), rx)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.retries, 3);
        assert_eq!(stats.acked, 2);
        assert_eq!(*handler.seen.lock().await, vec![0, 1]);
        assert_eq!(offsets.committed(), 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let (publisher, source) = channel(Topic::EnemyAttack);
        let offsets = source.offsets();
        publisher.publish("stuck");

        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(u32::MAX),
        });
        let policy = RetryPolicy {
            max_retries: Some(2),
            ..fast_retry()
        };
        let (_tx, rx) = watch::channel(false);
        let result = PartitionConsumer::new(source, handler, policy, rx).run().await;

        assert!(matches!(result, Err(Error::RetriesExhausted { offset: 0, .. })));
        assert_eq!(offsets.committed(), 0);
    }

    /// Channel source whose reads and acks fail a set number of times
    struct Flaky {
        inner: ChannelSource,
        read_failures: u32,
        ack_failures: u32,
        progress: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MessageSource for Flaky {
        async fn next(&mut self) -> Result<Option<BusMessage>> {
            if self.read_failures > 0 {
                self.read_failures -= 1;
                return Err(Error::Nats("missed idle heartbeat".to_string()));
            }
            self.inner.next().await
        }

        async fn ack(&mut self, message: &BusMessage) -> Result<()> {
            if self.ack_failures > 0 {
                self.ack_failures -= 1;
                return Err(Error::Ack("connection reset".to_string()));
            }
            self.inner.ack(message).await
        }

        async fn in_progress(&mut self, _message: &BusMessage) -> Result<()> {
            self.progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn recording(failures: u32) -> Arc<Recording> {
        Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(failures),
        })
    }

    #[tokio::test]
    async fn test_receive_error_does_not_stop_consumer() {
        let (publisher, inner) = channel(Topic::EnemyAttack);
        let offsets = inner.offsets();
        publisher.publish("after heartbeat");
        drop(publisher);

        let source = Flaky {
            inner,
            read_failures: 2,
            ack_failures: 0,
            progress: Arc::new(AtomicU32::new(0)),
        };
        let handler = recording(0);
        let (_tx, rx) = watch::channel(false);
        let stats = PartitionConsumer::new(source, handler.clone(), fast_retry(), rx)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.source_errors, 2);
        assert_eq!(stats.acked, 1);
        assert_eq!(*handler.seen.lock().await, vec![0]);
        assert_eq!(offsets.committed(), 1);
    }

    #[tokio::test]
    async fn test_failed_ack_moves_on() {
        let (publisher, inner) = channel(Topic::EnemyAttack);
        let offsets = inner.offsets();
        publisher.publish("a");
        publisher.publish("b");
        drop(publisher);

        let source = Flaky {
            inner,
            read_failures: 0,
            ack_failures: 1,
            progress: Arc::new(AtomicU32::new(0)),
        };
        let handler = recording(0);
        let (_tx, rx) = watch::channel(false);
        let stats = PartitionConsumer::new(source, handler.clone(), fast_retry(), rx)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.acked, 1);
        assert_eq!(stats.source_errors, 1);
        assert_eq!(*handler.seen.lock().await, vec![0, 1]);
        assert_eq!(offsets.committed(), 2);
    }

    #[tokio::test]
    async fn test_retry_extends_ack_deadline() {
        let (publisher, inner) = channel(Topic::ArenaMatchCompleted);
        publisher.publish("slow");
        drop(publisher);

        let progress = Arc::new(AtomicU32::new(0));
        let source = Flaky {
            inner,
            read_failures: 0,
            ack_failures: 0,
            progress: progress.clone(),
        };
        let (_tx, rx) = watch::channel(false);
        let stats = PartitionConsumer::new(source, recording(3), fast_retry(), rx)
            .run()
            .await
            .unwrap();

        assert_eq!(stats.retries, 3);
        assert_eq!(progress.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_consumer() {
        let (_publisher, source) = channel(Topic::WeaponRepair);
        let handler = Arc::new(Recording {
            seen: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(PartitionConsumer::new(source, handler, fast_retry(), rx).run());

        tx.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }
}
