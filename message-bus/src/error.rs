//! Error types for message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Stream or consumer could not be created
    #[error("Subscribe error: {0}")]
    Subscribe(String),

    /// Acknowledgement failed
    #[error("Ack error: {0}")]
    Ack(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// NATS error
    #[error("NATS error: {0}")]
    Nats(String),

    /// A message kept failing after the configured retry budget
    #[error("Retries exhausted for {topic} at offset {offset}")]
    RetriesExhausted {
        /// Topic the message came from
        topic: String,
        /// Offset of the stuck message
        offset: u64,
    },
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
