//! Partition sources
//!
//! A [`MessageSource`] yields the messages of exactly one partition in order
//! and records acknowledgements. The partition offset only advances through
//! [`MessageSource::ack`].

use crate::{message::BusMessage, types::Topic, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// FIFO source of one bus partition
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, or `None` once the partition is closed
    async fn next(&mut self) -> Result<Option<BusMessage>>;

    /// Acknowledge a message, advancing the partition offset past it
    async fn ack(&mut self, message: &BusMessage) -> Result<()>;

    /// Tell the source the message is still being worked on
    async fn in_progress(&mut self, _message: &BusMessage) -> Result<()> {
        Ok(())
    }
}

/// Shared view of a channel partition's committed offset
#[derive(Debug, Clone, Default)]
pub struct OffsetHandle(Arc<AtomicU64>);

impl OffsetHandle {
    /// Offset of the next unacknowledged message
    pub fn committed(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Publishing half of an in-process partition
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    topic: Topic,
    next_offset: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

impl ChannelPublisher {
    /// Append a payload to the partition, returning its offset
    pub fn publish(&self, payload: impl Into<Bytes>) -> u64 {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let message = BusMessage::new(self.topic.name(), self.topic.partition(), offset, payload);
        if self.tx.send(message).is_err() {
            tracing::warn!(topic = %self.topic, offset, "Partition closed, message dropped");
        }
        offset
    }

    /// Serialize a value as JSON and publish it
    pub fn publish_json<T: serde::Serialize>(&self, value: &T) -> Result<u64> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(payload))
    }
}

/// Consuming half of an in-process partition
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    committed: OffsetHandle,
}

impl ChannelSource {
    /// Handle for observing acknowledged offsets after the source is moved
    pub fn offsets(&self) -> OffsetHandle {
        self.committed.clone()
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next(&mut self) -> Result<Option<BusMessage>> {
        Ok(self.rx.recv().await)
    }

    async fn ack(&mut self, message: &BusMessage) -> Result<()> {
        // Offsets only move forward
        self.committed.0.fetch_max(message.offset + 1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create an in-process partition for a topic
///
/// The partition closes once every publisher has been dropped.
pub fn channel(topic: Topic) -> (ChannelPublisher, ChannelSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let publisher = ChannelPublisher {
        topic,
        next_offset: Arc::new(AtomicU64::new(0)),
        tx,
    };
    let source = ChannelSource {
        rx,
        committed: OffsetHandle::default(),
    };
    (publisher, source)
}
