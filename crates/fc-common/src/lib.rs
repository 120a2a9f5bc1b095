use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

/// Delay applied when a message is nacked because of rate limiting,
/// either locally (pool limiter) or remotely (HTTP 429).
pub const FAST_FAIL_DELAY_SECONDS: u32 = 10;

/// Default redelivery delay for transient mediation failures.
pub const DEFAULT_NACK_DELAY_SECONDS: u32 = 30;

/// SQS upper bound for a visibility change (12 hours).
pub const MAX_NACK_DELAY_SECONDS: u32 = 43_200;

// ============================================================================
// Message pointer
// ============================================================================

/// A routable message as it arrives on the wire.
///
/// The queue body is a JSON object with camelCase keys; unknown top-level
/// fields are ignored. The pointer is never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    /// Globally unique within the source queue's retention window.
    /// Used as the in-pipeline deduplication key.
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    #[serde(default)]
    pub mediation_target: String,
    #[serde(default)]
    pub message_group: Option<String>,
}

impl MessagePointer {
    /// Check the construction invariants: non-empty id and pool code, and a
    /// non-empty target for HTTP mediation. Consumers drop (and count)
    /// pointers that fail this instead of forwarding them.
    pub fn validate(&self) -> Result<(), PointerValidationError> {
        if self.id.trim().is_empty() {
            return Err(PointerValidationError::MissingId);
        }
        if self.pool_code.trim().is_empty() {
            return Err(PointerValidationError::MissingPoolCode);
        }
        match self.mediation_type {
            MediationType::Http if self.mediation_target.trim().is_empty() => {
                Err(PointerValidationError::MissingTarget)
            }
            _ => Ok(()),
        }
    }

    /// Group key used for ordering; `None` is the sentinel default group for
    /// which serialisation is not required.
    pub fn group(&self) -> Option<&str> {
        self.message_group.as_deref().filter(|g| !g.is_empty())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PointerValidationError {
    #[error("message id is empty")]
    MissingId,
    #[error("pool code is empty")]
    MissingPoolCode,
    #[error("mediation target is empty")]
    MissingTarget,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MediationType {
    #[serde(rename = "HTTP")]
    Http,
}

// ============================================================================
// Mediation outcome
// ============================================================================

/// Classified outcome of a single mediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediationResult {
    /// Delivered and accepted (2xx).
    Success,
    /// Permanent failure (4xx other than 408/425/429) - the message is
    /// poison, returning it to the queue would loop.
    ErrorClient,
    /// Transient failure (5xx, 408, 425, connect errors) - redeliver.
    ErrorServer,
    /// The request exceeded the mediator timeout - redeliver.
    ErrorTimeout,
    /// The target said to slow down (429) - redeliver quickly elsewhere.
    RateLimited,
    /// The response could not be read or made no sense - treated as poison.
    Invalid,
}

impl MediationResult {
    /// Whether this outcome settles the broker message with an ack.
    /// Everything else nacks for redelivery.
    pub fn settles_with_ack(&self) -> bool {
        matches!(
            self,
            MediationResult::Success | MediationResult::ErrorClient | MediationResult::Invalid
        )
    }

    /// Redelivery delay for nack outcomes.
    pub fn nack_delay_seconds(&self) -> u32 {
        match self {
            MediationResult::RateLimited => FAST_FAIL_DELAY_SECONDS,
            _ => DEFAULT_NACK_DELAY_SECONDS,
        }
    }

    /// Stable tag for metric labels and warning messages.
    pub fn tag(&self) -> &'static str {
        match self {
            MediationResult::Success => "SUCCESS",
            MediationResult::ErrorClient => "ERROR_CLIENT",
            MediationResult::ErrorServer => "ERROR_SERVER",
            MediationResult::ErrorTimeout => "ERROR_TIMEOUT",
            MediationResult::RateLimited => "RATE_LIMITED",
            MediationResult::Invalid => "INVALID",
        }
    }
}

/// Result of a mediation attempt plus whatever context the transport gave us.
#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    /// Server-suggested retry delay (Retry-After on a 429).
    pub retry_after_seconds: Option<u32>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            status_code: Some(status_code),
            error: None,
            retry_after_seconds: None,
        }
    }

    pub fn client_error(status_code: u16, error: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorClient,
            status_code: Some(status_code),
            error: Some(error.into()),
            retry_after_seconds: None,
        }
    }

    pub fn server_error(status_code: Option<u16>, error: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorServer,
            status_code,
            error: Some(error.into()),
            retry_after_seconds: None,
        }
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorTimeout,
            status_code: None,
            error: Some(error.into()),
            retry_after_seconds: None,
        }
    }

    pub fn rate_limited(retry_after_seconds: Option<u32>) -> Self {
        Self {
            result: MediationResult::RateLimited,
            status_code: Some(429),
            error: None,
            retry_after_seconds,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            result: MediationResult::Invalid,
            status_code: None,
            error: Some(error.into()),
            retry_after_seconds: None,
        }
    }

    /// Delay to use when this outcome nacks: the server suggestion when
    /// present, the policy default otherwise.
    pub fn nack_delay_seconds(&self) -> u32 {
        self.retry_after_seconds
            .unwrap_or_else(|| self.result.nack_delay_seconds())
    }
}

// ============================================================================
// Routing traits
// ============================================================================

/// Per-message completion channel back to the source queue.
///
/// A consumer builds one per received message, closing over the receipt
/// handle (or delivery tag). Exactly one of `ack`/`nack` is invoked for every
/// message the router accepts.
#[async_trait]
pub trait MessageCallback: Send + Sync {
    /// Settle the message: delete it from the source queue.
    async fn ack(&self);

    /// Return the message to the source queue, visible again after `delay`
    /// seconds (consumer default when `None`).
    async fn nack(&self, delay_seconds: Option<u32>);

    /// Push the redelivery horizon out for a message still being worked on.
    /// No-op where the broker has no such concept.
    async fn extend_visibility(&self, _seconds: u32) {}
}

/// What the router did with a message handed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// In the pipeline; the callback will be invoked exactly once.
    Accepted,
    /// Same id already in flight; the callback was dropped. The consumer
    /// settles the duplicate delivery according to its `DuplicatePolicy`.
    Duplicate,
    /// Pool queue full or pool limit hit; the callback was dropped and the
    /// consumer should defer the message for a quick retry.
    Rejected,
}

/// Consumer-side policy for a `RouteDecision::Duplicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Ack the duplicate delivery; the original in-flight completion settles
    /// its own broker message.
    #[default]
    AckDuplicate,
    /// Leave the duplicate to the broker: nack so it redelivers after the
    /// original completes.
    DeferDuplicate,
}

/// The routing surface consumers talk to. Implemented by the core router;
/// non-blocking and safe for concurrent invocation.
pub trait MessageRouter: Send + Sync {
    fn route_message(
        &self,
        message: MessagePointer,
        callback: Arc<dyn MessageCallback>,
    ) -> RouteDecision;
}

/// In-pipeline bookkeeping for one accepted message.
#[derive(Debug, Clone)]
pub struct PipelineEntry {
    pub pointer: MessagePointer,
    pub accepted_at: Instant,
}

impl PipelineEntry {
    pub fn new(pointer: MessagePointer) -> Self {
        Self {
            pointer,
            accepted_at: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.accepted_at.elapsed().as_secs()
    }
}

// ============================================================================
// Router configuration
// ============================================================================

/// Immutable router configuration, replaced atomically at each sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub queues: Vec<QueueSpec>,
    #[serde(default = "default_sync_interval", alias = "syncInterval")]
    pub sync_interval_seconds: u64,
    #[serde(default = "default_max_pools")]
    pub max_pools: usize,
    #[serde(default = "default_pool_warning_threshold")]
    pub pool_warning_threshold: usize,
}

fn default_sync_interval() -> u64 {
    300
}

fn default_max_pools() -> usize {
    2000
}

fn default_pool_warning_threshold() -> usize {
    1000
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            pools: Vec::new(),
            queues: Vec::new(),
            sync_interval_seconds: default_sync_interval(),
            max_pools: default_max_pools(),
            pool_warning_threshold: default_pool_warning_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    pub code: String,
    pub concurrency: u32,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

impl PoolSpec {
    /// Bounded queue depth for this pool.
    pub fn queue_capacity(&self) -> u32 {
        (self.concurrency * 10).max(500)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum QueueKind {
    #[serde(rename = "SQS_LIKE")]
    SqsLike,
    #[serde(rename = "AMQP")]
    Amqp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub identifier: String,
    #[serde(default = "default_connections")]
    pub connections: u32,
    pub kind: QueueKind,
    pub endpoint: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u32,
}

fn default_connections() -> u32 {
    1
}

fn default_visibility_timeout() -> u32 {
    120
}

// ============================================================================
// Warnings
// ============================================================================

/// Warning categories the core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningCategory {
    Mediation,
    Routing,
    QueueFull,
    RateLimit,
    PoolLimit,
    PipelineMapLeak,
    MapSizeMismatch,
    ShutdownCleanupErrors,
    ConfigSyncFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

/// A structured operational warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}

// ============================================================================
// Pool statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_parses_wire_format() {
        let body = r#"{
            "id": "m-1",
            "poolCode": "WEBHOOKS",
            "authToken": "tok",
            "mediationType": "HTTP",
            "mediationTarget": "https://example.test/hook",
            "messageGroup": "order-42",
            "someFutureField": true
        }"#;

        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.id, "m-1");
        assert_eq!(pointer.pool_code, "WEBHOOKS");
        assert_eq!(pointer.mediation_type, MediationType::Http);
        assert_eq!(pointer.group(), Some("order-42"));
        assert!(pointer.validate().is_ok());
    }

    #[test]
    fn pointer_without_group_uses_sentinel() {
        let body = r#"{"id":"m-2","poolCode":"P","mediationType":"HTTP","mediationTarget":"http://t"}"#;
        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.group(), None);
    }

    #[test]
    fn pointer_validation_rejects_empty_fields() {
        let body = r#"{"id":"","poolCode":"P","mediationType":"HTTP","mediationTarget":"http://t"}"#;
        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.validate(), Err(PointerValidationError::MissingId));

        let body = r#"{"id":"x","poolCode":"P","mediationType":"HTTP","mediationTarget":""}"#;
        let pointer: MessagePointer = serde_json::from_str(body).unwrap();
        assert_eq!(pointer.validate(), Err(PointerValidationError::MissingTarget));
    }

    #[test]
    fn mediation_result_settlement_policy() {
        assert!(MediationResult::Success.settles_with_ack());
        assert!(MediationResult::ErrorClient.settles_with_ack());
        assert!(MediationResult::Invalid.settles_with_ack());
        assert!(!MediationResult::ErrorServer.settles_with_ack());
        assert!(!MediationResult::ErrorTimeout.settles_with_ack());
        assert!(!MediationResult::RateLimited.settles_with_ack());

        assert_eq!(
            MediationResult::RateLimited.nack_delay_seconds(),
            FAST_FAIL_DELAY_SECONDS
        );
        assert_eq!(
            MediationResult::ErrorServer.nack_delay_seconds(),
            DEFAULT_NACK_DELAY_SECONDS
        );
    }

    #[test]
    fn outcome_prefers_retry_after() {
        let outcome = MediationOutcome::rate_limited(Some(25));
        assert_eq!(outcome.nack_delay_seconds(), 25);

        let outcome = MediationOutcome::rate_limited(None);
        assert_eq!(outcome.nack_delay_seconds(), FAST_FAIL_DELAY_SECONDS);
    }

    #[test]
    fn pool_spec_queue_capacity_floor() {
        let small = PoolSpec {
            code: "S".to_string(),
            concurrency: 5,
            rate_limit_per_minute: None,
        };
        assert_eq!(small.queue_capacity(), 500);

        let large = PoolSpec {
            code: "L".to_string(),
            concurrency: 100,
            rate_limit_per_minute: None,
        };
        assert_eq!(large.queue_capacity(), 1000);
    }

    #[test]
    fn router_config_defaults() {
        let config: RouterConfig = serde_json::from_str(r#"{"pools":[],"queues":[]}"#).unwrap();
        assert_eq!(config.sync_interval_seconds, 300);
        assert_eq!(config.max_pools, 2000);
        assert_eq!(config.pool_warning_threshold, 1000);
    }

    #[test]
    fn queue_spec_parses_kinds() {
        let body = r#"{
            "identifier": "orders",
            "kind": "SQS_LIKE",
            "endpoint": "https://sqs.eu-west-1.amazonaws.com/1/orders"
        }"#;
        let spec: QueueSpec = serde_json::from_str(body).unwrap();
        assert_eq!(spec.kind, QueueKind::SqsLike);
        assert_eq!(spec.connections, 1);
        assert_eq!(spec.visibility_timeout_seconds, 120);
    }
}
