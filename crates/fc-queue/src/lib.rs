//! Queue consumers for the FlowCatalyst router.
//!
//! A consumer owns its poll loop: it receives messages from the source queue,
//! parses each body into a [`MessagePointer`](fc_common::MessagePointer),
//! hands it to the router, and settles the broker message through the
//! per-message callback the router invokes on completion.

use async_trait::async_trait;

pub mod error;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Visibility delay used when the router rejects a message (pool queue full
/// or pool limit): retry soon, it is backpressure rather than a failure.
pub const DEFER_DELAY_SECONDS: u32 = 5;

/// How often consumers probe the broker for queue depth.
pub const DEPTH_PROBE_INTERVAL_SECONDS: u64 = 5;

/// Lifecycle contract shared by all consumer variants.
///
/// `start` spawns the consumer's poll tasks (one per configured connection)
/// plus its depth probe; `stop` signals them and closes network resources.
/// Callback closures handed out before `stop` remain valid - their broker
/// effects may fail silently once the connection is gone.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Unique identifier of this consumer (the configured queue identifier).
    fn identifier(&self) -> &str;

    /// Spawn poll and depth-probe tasks. Idempotent.
    async fn start(&self);

    /// Signal poll tasks to exit and release broker resources.
    async fn stop(&self);

    fn is_healthy(&self) -> bool;
}

// Queue-side metric emitters. Pool and router metrics live in fc-router.

pub fn record_messages_received(queue: &str, count: u64) {
    metrics::counter!("fc_queue_messages_received_total", "queue" => queue.to_string())
        .increment(count);
}

pub fn record_message_settled(queue: &str, success: bool) {
    metrics::counter!(
        "fc_queue_messages_processed_total",
        "queue" => queue.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

pub fn record_malformed_payload(queue: &str) {
    metrics::counter!("fc_queue_malformed_payloads_total", "queue" => queue.to_string())
        .increment(1);
}

pub fn record_duplicate(queue: &str) {
    metrics::counter!("fc_queue_duplicates_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_rejected(queue: &str) {
    metrics::counter!("fc_queue_rejected_total", "queue" => queue.to_string()).increment(1);
}

pub fn set_queue_depth(queue: &str, visible: u64, invisible: u64) {
    metrics::gauge!("fc_queue_depth", "queue" => queue.to_string()).set(visible as f64);
    metrics::gauge!("fc_queue_invisible_depth", "queue" => queue.to_string())
        .set(invisible as f64);
}
