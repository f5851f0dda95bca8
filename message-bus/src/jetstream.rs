//! JetStream partition source
//!
//! Each topic is bound to a durable pull consumer on the shared events stream.
//! `max_ack_pending = 1` keeps delivery strictly sequential per partition, and
//! the stable consumer name lets replicas share one logical subscription.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    AckKind,
    stream::{Config as StreamConfig, StorageType},
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

use crate::{message::BusMessage, source::MessageSource, types::Topic, Error, Result};

/// Subscriber configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberConfig {
    /// JetStream stream holding every subscribed subject
    pub stream_name: String,

    /// Stable group id; consumer names derive from it
    pub group_id: String,

    /// Acknowledgment wait time (seconds); kept above the retry delay cap
    pub ack_wait_secs: u64,

    /// Max delivery attempts (-1 = unlimited)
    pub max_deliver: i64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            stream_name: "COIN_EVENTS".to_string(),
            group_id: "coin-ledger".to_string(),
            ack_wait_secs: 60,
            max_deliver: -1,
        }
    }
}

impl SubscriberConfig {
    /// Durable consumer name for a topic
    pub fn consumer_name(&self, topic: Topic) -> String {
        format!("{}-{}", self.group_id, topic.name())
    }
}

/// Source reading one topic from JetStream
pub struct JetStreamSource {
    topic: Topic,
    messages: pull::Stream,
    pending: Option<jetstream::Message>,
}

impl JetStreamSource {
    /// Bind a durable consumer for `topic`, creating stream and consumer when missing
    pub async fn connect(
        client: &async_nats::Client,
        config: &SubscriberConfig,
        topic: Topic,
    ) -> Result<Self> {
        let context = jetstream::new(client.clone());

        let stream = context
            .get_or_create_stream(StreamConfig {
                name: config.stream_name.clone(),
                description: Some("Game economy events consumed by the coin ledger".to_string()),
                subjects: Topic::ALL.iter().map(|t| t.subject().to_string()).collect(),
                max_age: Duration::from_secs(7 * 24 * 3600),
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                error!("Failed to create stream {}: {}", config.stream_name, e);
                Error::Subscribe(e.to_string())
            })?;

        let consumer_name = config.consumer_name(topic);
        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    filter_subject: topic.subject().to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: Duration::from_secs(config.ack_wait_secs),
                    max_deliver: config.max_deliver,
                    max_ack_pending: 1,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        info!(
            "JetStream consumer ready: stream={}, consumer={}",
            config.stream_name, consumer_name
        );

        Ok(Self {
            topic,
            messages,
            pending: None,
        })
    }
}

impl JetStreamSource {
    fn pending(&self, message: &BusMessage) -> Result<&jetstream::Message> {
        self.pending.as_ref().ok_or_else(|| {
            Error::Ack(format!(
                "No pending delivery for {} offset {}",
                message.topic, message.offset
            ))
        })
    }
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn next(&mut self) -> Result<Option<BusMessage>> {
        let Some(delivered) = self.messages.next().await else {
            return Ok(None);
        };
        let delivered = delivered.map_err(|e| Error::Nats(e.to_string()))?;

        let offset = delivered
            .info()
            .map(|info| info.stream_sequence)
            .unwrap_or_default();
        let message = BusMessage::new(
            self.topic.name(),
            self.topic.partition(),
            offset,
            delivered.payload.clone(),
        );
        self.pending = Some(delivered);

        Ok(Some(message))
    }

    async fn ack(&mut self, message: &BusMessage) -> Result<()> {
        let delivered = self.pending(message)?;
        delivered.ack().await.map_err(|e| Error::Ack(e.to_string()))?;
        self.pending = None;
        Ok(())
    }

    async fn in_progress(&mut self, message: &BusMessage) -> Result<()> {
        self.pending(message)?
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::RetryPolicy;

    #[test]
    fn test_subscriber_config_default() {
        let config = SubscriberConfig::default();
        assert_eq!(config.stream_name, "COIN_EVENTS");
        assert_eq!(config.max_deliver, -1);
        assert!(Duration::from_secs(config.ack_wait_secs) > RetryPolicy::default().delay(64));
    }

    #[test]
    fn test_consumer_name_is_stable() {
        let config = SubscriberConfig::default();
        assert_eq!(
            config.consumer_name(Topic::EnemyAttack),
            "coin-ledger-enemy-attack"
        );
    }
}
