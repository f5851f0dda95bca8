//! Raw message delivered from a partition

use bytes::Bytes;

/// One message read from a bus partition
///
/// The payload is kept as raw bytes; decoding is the handler's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Topic name the message was published on
    pub topic: String,

    /// Partition the message belongs to
    pub partition: u32,

    /// Position within the partition
    pub offset: u64,

    /// UTF-8 JSON payload
    pub payload: Bytes,
}

impl BusMessage {
    /// Create new message
    pub fn new(topic: impl Into<String>, partition: u32, offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload: payload.into(),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
