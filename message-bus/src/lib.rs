//! Message bus plumbing for the coin ledger
//!
//! Provides partitioned, acknowledged consumption of the game-economy topics:
//! - One FIFO partition per topic, processed by a single worker
//! - JetStream durable pull consumers with explicit acks
//! - In-process channel source for tests and local runs
//! - Retry of transient failures with exponential backoff and jitter
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod consumer;
pub mod error;
pub mod jetstream;
pub mod message;
pub mod metrics;
pub mod source;
pub mod types;

pub use consumer::{ConsumerStats, Disposition, MessageHandler, PartitionConsumer, RetryPolicy};
pub use error::{Error, Result};
pub use jetstream::{JetStreamSource, SubscriberConfig};
pub use message::BusMessage;
pub use source::{channel, ChannelPublisher, ChannelSource, MessageSource, OffsetHandle};
pub use types::Topic;
