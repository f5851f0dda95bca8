//! Prometheus metrics for message bus

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Total messages handled, by topic and disposition
    pub static ref MESSAGE_RECEIVE_TOTAL: IntCounterVec = register_int_counter_vec!(
        "message_bus_receive_total",
        "Total messages received",
        &["topic", "disposition"]
    )
    .expect("metric can be created");

    /// Message processing duration
    pub static ref MESSAGE_PROCESS_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_process_duration_seconds",
        "Message processing duration in seconds",
        &["topic"]
    )
    .expect("metric can be created");

    /// Retries of a message that hit a transient failure
    pub static ref MESSAGE_RETRY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "message_bus_retry_total",
        "Total handler retries after transient failures",
        &["topic"]
    )
    .expect("metric can be created");

    /// Failed reads and acks, by operation
    pub static ref SOURCE_ERROR_TOTAL: IntCounterVec = register_int_counter_vec!(
        "message_bus_source_errors_total",
        "Total failed receives or acks from the partition source",
        &["operation"]
    )
    .expect("metric can be created");
}
