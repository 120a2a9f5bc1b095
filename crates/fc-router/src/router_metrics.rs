//! Metric emitters for the routing core.
//!
//! Names are Prometheus-flavoured via the `metrics` facade; the binary
//! installs the actual recorder.

use std::time::Duration;

use fc_common::PoolStats;

pub fn record_message_processed(pool_code: &str, result_tag: &str) {
    metrics::counter!(
        "fc_messages_processed_total",
        "pool" => pool_code.to_string(),
        "result" => result_tag.to_string()
    )
    .increment(1);
}

pub fn record_mediation_duration(pool_code: &str, duration: Duration) {
    metrics::histogram!(
        "fc_mediation_duration_seconds",
        "pool" => pool_code.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_rate_limit_exceeded(pool_code: &str) {
    metrics::counter!(
        "fc_rate_limit_exceeded_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

pub fn record_worker_panic(pool_code: &str) {
    metrics::counter!(
        "fc_worker_panics_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

/// Refresh every per-pool gauge from a stats snapshot.
pub fn set_pool_gauges(stats: &PoolStats) {
    let pool = stats.pool_code.clone();
    metrics::gauge!("fc_pool_active_workers", "pool" => pool.clone())
        .set(stats.active_workers as f64);
    metrics::gauge!("fc_pool_available_permits", "pool" => pool.clone())
        .set(stats.concurrency.saturating_sub(stats.active_workers) as f64);
    metrics::gauge!("fc_pool_queue_size", "pool" => pool.clone()).set(stats.queue_size as f64);
    metrics::gauge!("fc_pool_message_groups", "pool" => pool)
        .set(stats.message_group_count as f64);
}

pub fn set_router_gauges(in_pipeline: usize, callbacks: usize, active_pools: usize) {
    metrics::gauge!("fc_in_pipeline_messages").set(in_pipeline as f64);
    metrics::gauge!("fc_callbacks_size").set(callbacks as f64);
    metrics::gauge!("fc_active_pools").set(active_pools as f64);
}
