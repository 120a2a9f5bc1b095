//! FlowCatalyst routing core.
//!
//! The runtime between "message received from queue" and "ack/nack returned":
//! - Router: deduplication, pool selection, pipeline-map ownership, shutdown
//! - ProcessPool: bounded queue, worker pool, concurrency and rate gates
//! - GroupTracker: at-most-one in-flight message per (pool, group)
//! - PoolRateLimiter: per-pool token bucket with non-blocking acquire
//! - HttpMediator: the outbound call and its outcome classification
//! - ConfigSync: periodic reconcile against the fetched RouterConfig
//! - WarningSink: structured operational warnings
//! - LifecycleManager: leak audit, draining sweep, gauge refresh

pub mod config_sync;
pub mod error;
pub mod group;
pub mod lifecycle;
pub mod limiter;
pub mod mediator;
pub mod pool;
pub mod router;
pub mod router_metrics;
pub mod warning;

pub use config_sync::{
    spawn_config_sync_task, ConfigSyncConfig, ConfigSyncService, ConsumerFactory,
};
pub use error::RouterError;
pub use group::GroupTracker;
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use limiter::PoolRateLimiter;
pub use mediator::{
    HttpMediator, HttpMediatorConfig, Mediator, MediatorRegistry, MESSAGE_ID_HEADER, POOL_HEADER,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use pool::{CompletionSink, PoolState, ProcessPool};
pub use router::{Router, DEFAULT_POOL_CODE};
pub use warning::{WarningSink, WarningSinkConfig};

pub type Result<T> = std::result::Result<T, RouterError>;
