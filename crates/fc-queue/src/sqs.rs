//! SQS queue consumer.
//!
//! Long-polls `ReceiveMessage` on one or more connections, parses each body
//! into a `MessagePointer` and routes it. The per-message callback closes over
//! the receipt handle: ack deletes the message, nack changes its visibility.
//!
//! Recovery from expired receipt handles: when a delete fails after successful
//! processing, the broker message id is remembered in a pending-delete set and
//! the redelivered copy is deleted immediately on its next appearance, before
//! it reaches the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::{Message as SqsMessage, QueueAttributeName};
use aws_sdk_sqs::Client;
use dashmap::DashSet;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fc_common::{
    DuplicatePolicy, MessageCallback, MessagePointer, MessageRouter, RouteDecision,
    DEFAULT_NACK_DELAY_SECONDS, FAST_FAIL_DELAY_SECONDS, MAX_NACK_DELAY_SECONDS,
};

use crate::{QueueConsumer, DEFER_DELAY_SECONDS, DEPTH_PROBE_INTERVAL_SECONDS};

/// SQS caps a single receive at 10 messages.
const MAX_BATCH_SIZE: i32 = 10;

/// Pause after an empty poll; keeps idle consumers cheap.
const EMPTY_BATCH_PAUSE: Duration = Duration::from_secs(1);

/// Pause after a partial batch; a full batch polls again immediately.
const PARTIAL_BATCH_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SqsConsumerConfig {
    pub queue_url: String,
    /// Stable identifier used in logs, metrics and the router registry.
    pub identifier: String,
    /// Number of parallel long-poll tasks.
    pub connections: u32,
    /// Must cover the worst-case mediation duration plus margin.
    pub visibility_timeout_seconds: i32,
    /// Long-poll wait, clamped to the SQS maximum of 20.
    pub wait_time_seconds: i32,
    pub duplicate_policy: DuplicatePolicy,
}

impl SqsConsumerConfig {
    pub fn new(queue_url: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            identifier: identifier.into(),
            connections: 1,
            visibility_timeout_seconds: 120,
            wait_time_seconds: 20,
            duplicate_policy: DuplicatePolicy::default(),
        }
    }

    pub fn with_connections(mut self, connections: u32) -> Self {
        self.connections = connections.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, seconds: i32) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }
}

pub struct SqsConsumer {
    inner: Arc<SqsConsumerInner>,
}

struct SqsConsumerInner {
    client: Client,
    config: SqsConsumerConfig,
    router: Arc<dyn MessageRouter>,
    running: AtomicBool,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Broker message ids that were processed but whose delete failed on an
    /// expired receipt; deleted with a fresh handle on reappearance.
    pending_deletes: Arc<DashSet<String>>,
}

impl SqsConsumer {
    pub fn new(client: Client, config: SqsConsumerConfig, router: Arc<dyn MessageRouter>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SqsConsumerInner {
                client,
                config,
                router,
                running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                shutdown_tx,
                pending_deletes: Arc::new(DashSet::new()),
            }),
        }
    }
}

#[async_trait]
impl QueueConsumer for SqsConsumer {
    fn identifier(&self) -> &str {
        &self.inner.config.identifier
    }

    async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            queue = %self.inner.config.identifier,
            connections = self.inner.config.connections,
            visibility_timeout = self.inner.config.visibility_timeout_seconds,
            "Starting SQS consumer"
        );

        for connection in 0..self.inner.config.connections {
            let inner = self.inner.clone();
            let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
            tokio::spawn(async move {
                inner.poll_loop(connection, &mut shutdown_rx).await;
            });
        }

        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            inner.depth_probe_loop(&mut shutdown_rx).await;
        });
    }

    async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        info!(queue = %self.inner.config.identifier, "SQS consumer stopped");
    }

    fn is_healthy(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

impl SqsConsumerInner {
    async fn poll_loop(&self, connection: u32, shutdown_rx: &mut watch::Receiver<bool>) {
        debug!(
            queue = %self.config.identifier,
            connection = connection,
            "SQS poll task started"
        );

        while self.running.load(Ordering::SeqCst) {
            let received = tokio::select! {
                result = self.poll_once() => result,
                _ = shutdown_rx.changed() => break,
            };

            match received {
                Ok(count) => {
                    // Adaptive pacing: idle queues back off, busy queues don't.
                    if count == 0 {
                        tokio::time::sleep(EMPTY_BATCH_PAUSE).await;
                    } else if count < MAX_BATCH_SIZE as usize {
                        tokio::time::sleep(PARTIAL_BATCH_PAUSE).await;
                    }
                }
                Err(e) => {
                    error!(
                        queue = %self.config.identifier,
                        connection = connection,
                        error = %e,
                        "SQS receive failed"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        debug!(
            queue = %self.config.identifier,
            connection = connection,
            "SQS poll task exited"
        );
    }

    /// One receive round. Returns the raw batch size for pacing.
    async fn poll_once(&self) -> crate::Result<usize> {
        let result = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .max_number_of_messages(MAX_BATCH_SIZE)
            .visibility_timeout(self.config.visibility_timeout_seconds)
            .wait_time_seconds(self.config.wait_time_seconds.clamp(0, 20))
            .send()
            .await
            .map_err(|e| crate::QueueError::Broker(e.to_string()))?;

        let messages = result.messages.unwrap_or_default();
        let batch_size = messages.len();

        if batch_size > 0 {
            crate::record_messages_received(&self.config.identifier, batch_size as u64);
        }

        for message in messages {
            self.handle_message(message).await;
        }

        Ok(batch_size)
    }

    async fn handle_message(&self, sqs_msg: SqsMessage) {
        let receipt_handle = match sqs_msg.receipt_handle() {
            Some(h) => h.to_string(),
            None => {
                warn!(queue = %self.config.identifier, "Received message without receipt handle");
                return;
            }
        };
        let broker_message_id = sqs_msg.message_id().map(|s| s.to_string());

        // A reappearing message whose earlier delete failed: processing
        // already completed, delete it with the fresh receipt handle.
        if let Some(ref broker_id) = broker_message_id {
            if self.pending_deletes.remove(broker_id).is_some() {
                info!(
                    queue = %self.config.identifier,
                    broker_message_id = %broker_id,
                    "Previously processed message reappeared - deleting now"
                );
                self.delete(&receipt_handle).await;
                return;
            }
        }

        let pointer = match self.parse_pointer(sqs_msg.body()) {
            Some(p) => p,
            None => {
                // Metrics-only; the source queue's redrive policy owns
                // poison messages.
                crate::record_malformed_payload(&self.config.identifier);
                return;
            }
        };

        let message_id = pointer.id.clone();
        let callback: Arc<dyn MessageCallback> = Arc::new(SqsMessageCallback {
            client: self.client.clone(),
            queue_url: self.config.queue_url.clone(),
            queue_identifier: self.config.identifier.clone(),
            receipt_handle: receipt_handle.clone(),
            broker_message_id,
            message_id: message_id.clone(),
            pending_deletes: self.pending_deletes.clone(),
        });

        match self.router.route_message(pointer, callback) {
            RouteDecision::Accepted => {}
            RouteDecision::Duplicate => {
                debug!(
                    queue = %self.config.identifier,
                    message_id = %message_id,
                    "Duplicate id in pipeline"
                );
                crate::record_duplicate(&self.config.identifier);
                match self.config.duplicate_policy {
                    DuplicatePolicy::AckDuplicate => self.delete(&receipt_handle).await,
                    DuplicatePolicy::DeferDuplicate => {
                        self.change_visibility(&receipt_handle, FAST_FAIL_DELAY_SECONDS)
                            .await
                    }
                }
            }
            RouteDecision::Rejected => {
                crate::record_rejected(&self.config.identifier);
                self.change_visibility(&receipt_handle, DEFER_DELAY_SECONDS)
                    .await;
            }
        }
    }

    fn parse_pointer(&self, body: Option<&str>) -> Option<MessagePointer> {
        let body = body?;
        let pointer: MessagePointer = match serde_json::from_str(body) {
            Ok(p) => p,
            Err(e) => {
                warn!(queue = %self.config.identifier, error = %e, "Malformed queue payload");
                return None;
            }
        };
        if let Err(e) = pointer.validate() {
            warn!(
                queue = %self.config.identifier,
                message_id = %pointer.id,
                error = %e,
                "Invalid message pointer"
            );
            return None;
        }
        Some(pointer)
    }

    async fn delete(&self, receipt_handle: &str) {
        if let Err(e) = self
            .client
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            debug!(queue = %self.config.identifier, error = %e, "Delete failed");
        }
    }

    async fn change_visibility(&self, receipt_handle: &str, delay_seconds: u32) {
        if let Err(e) = self
            .client
            .change_message_visibility()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(delay_seconds.min(MAX_NACK_DELAY_SECONDS) as i32)
            .send()
            .await
        {
            debug!(queue = %self.config.identifier, error = %e, "Visibility change failed");
        }
    }

    async fn depth_probe_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(DEPTH_PROBE_INTERVAL_SECONDS));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_depth().await {
                        debug!(queue = %self.config.identifier, error = %e, "Depth probe failed");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    async fn probe_depth(&self) -> crate::Result<()> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.config.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| crate::QueueError::Broker(e.to_string()))?;

        let attributes = result.attributes();
        let visible = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let invisible = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        crate::set_queue_depth(&self.config.identifier, visible, invisible);
        Ok(())
    }
}

/// Completion channel for one received SQS message.
struct SqsMessageCallback {
    client: Client,
    queue_url: String,
    queue_identifier: String,
    receipt_handle: String,
    broker_message_id: Option<String>,
    message_id: String,
    pending_deletes: Arc<DashSet<String>>,
}

#[async_trait]
impl MessageCallback for SqsMessageCallback {
    async fn ack(&self) {
        crate::record_message_settled(&self.queue_identifier, true);

        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await;

        if let Err(e) = result {
            // Receipt handle has likely expired mid-mediation. Remember the
            // broker id so the redelivered copy gets deleted on next poll.
            match self.broker_message_id {
                Some(ref broker_id) => {
                    info!(
                        queue = %self.queue_identifier,
                        message_id = %self.message_id,
                        broker_message_id = %broker_id,
                        error = %e,
                        "Delete failed - deferring to next appearance"
                    );
                    self.pending_deletes.insert(broker_id.clone());
                }
                None => {
                    error!(
                        queue = %self.queue_identifier,
                        message_id = %self.message_id,
                        error = %e,
                        "Delete failed with no broker message id to track"
                    );
                }
            }
        }
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        crate::record_message_settled(&self.queue_identifier, false);

        let delay = delay_seconds
            .unwrap_or(DEFAULT_NACK_DELAY_SECONDS)
            .min(MAX_NACK_DELAY_SECONDS);

        let result = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(delay as i32)
            .send()
            .await;

        if let Err(e) = result {
            // Expired handle: the message will reappear on its own schedule.
            debug!(
                queue = %self.queue_identifier,
                message_id = %self.message_id,
                error = %e,
                "Visibility change on nack failed"
            );
        }
    }

    async fn extend_visibility(&self, seconds: u32) {
        let result = self
            .client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(seconds.min(MAX_NACK_DELAY_SECONDS) as i32)
            .send()
            .await;

        if let Err(e) = result {
            debug!(
                queue = %self.queue_identifier,
                message_id = %self.message_id,
                error = %e,
                "Visibility extension failed"
            );
        }
    }
}
