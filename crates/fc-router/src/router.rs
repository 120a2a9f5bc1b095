//! Router - central orchestrator between queue consumers and process pools.
//!
//! Owns the in-pipeline map (global deduplication) and the callback map, and
//! is the only mutator of either. Consumers hand messages in through
//! [`MessageRouter::route_message`]; pool workers settle them through the
//! [`CompletionSink`] this module implements, which removes the pipeline
//! entries and forwards to the consumer callback stored at routing time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use fc_common::{
    MessageCallback, MessagePointer, MessageRouter, PipelineEntry, PoolSpec, PoolStats,
    RouteDecision, WarningCategory, WarningSeverity, DEFAULT_NACK_DELAY_SECONDS,
};
use fc_queue::QueueConsumer;

use crate::mediator::Mediator;
use crate::pool::{CompletionSink, ProcessPool};
use crate::router_metrics;
use crate::warning::WarningSink;
use crate::{Result, RouterError};

/// Pool used for messages whose pool code is not configured.
pub const DEFAULT_POOL_CODE: &str = "DEFAULT-POOL";
const DEFAULT_POOL_CONCURRENCY: u32 = 20;

/// Tolerated transient divergence between the two pipeline maps.
const MAP_SIZE_TOLERANCE: usize = 10;

/// Messages in the pipeline longer than this get their visibility extended.
const VISIBILITY_EXTENSION_THRESHOLD_SECONDS: u64 = 50;
const VISIBILITY_EXTENSION_SECONDS: u32 = 120;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// The process-wide pipeline: id -> pointer and id -> consumer callback.
/// The two maps have identical key sets at rest.
struct PipelineState {
    in_pipeline: DashMap<String, PipelineEntry>,
    callbacks: DashMap<String, Arc<dyn MessageCallback>>,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            in_pipeline: DashMap::new(),
            callbacks: DashMap::new(),
        }
    }

    /// Remove both entries for an id; returns the stored callback the first
    /// time and `None` on any later attempt, which is what makes settlement
    /// exactly-once even if a worker path fires twice.
    fn take(&self, id: &str) -> Option<Arc<dyn MessageCallback>> {
        self.in_pipeline.remove(id);
        self.callbacks.remove(id).map(|(_, cb)| cb)
    }
}

/// The router's side of the pool contract. Pools hold this, not the router,
/// so there is no ownership cycle.
struct PipelineCompletions {
    state: Arc<PipelineState>,
}

#[async_trait]
impl CompletionSink for PipelineCompletions {
    async fn ack(&self, message: &MessagePointer) {
        match self.state.take(&message.id) {
            Some(callback) => callback.ack().await,
            None => debug!(message_id = %message.id, "Ack for already-settled message"),
        }
    }

    async fn nack(&self, message: &MessagePointer, delay_seconds: Option<u32>) {
        match self.state.take(&message.id) {
            Some(callback) => callback.nack(delay_seconds).await,
            None => debug!(message_id = %message.id, "Nack for already-settled message"),
        }
    }
}

pub struct Router {
    state: Arc<PipelineState>,
    completions: Arc<PipelineCompletions>,
    mediator: Arc<dyn Mediator>,
    warnings: Arc<WarningSink>,

    pools: DashMap<String, Arc<ProcessPool>>,
    /// Pools removed or replaced by config sync, finishing accepted work.
    draining_pools: DashMap<String, Arc<ProcessPool>>,
    consumers: RwLock<HashMap<String, Arc<dyn QueueConsumer>>>,

    max_pools: AtomicUsize,
    pool_warning_threshold: AtomicUsize,
    running: AtomicBool,
}

impl Router {
    pub fn new(mediator: Arc<dyn Mediator>, warnings: Arc<WarningSink>) -> Self {
        Self::with_limits(mediator, warnings, 2000, 1000)
    }

    pub fn with_limits(
        mediator: Arc<dyn Mediator>,
        warnings: Arc<WarningSink>,
        max_pools: usize,
        pool_warning_threshold: usize,
    ) -> Self {
        let state = Arc::new(PipelineState::new());
        let completions = Arc::new(PipelineCompletions {
            state: state.clone(),
        });

        Self {
            state,
            completions,
            mediator,
            warnings,
            pools: DashMap::new(),
            draining_pools: DashMap::new(),
            consumers: RwLock::new(HashMap::new()),
            max_pools: AtomicUsize::new(max_pools),
            pool_warning_threshold: AtomicUsize::new(pool_warning_threshold),
            running: AtomicBool::new(true),
        }
    }

    pub fn warnings(&self) -> &Arc<WarningSink> {
        &self.warnings
    }

    pub fn set_pool_limits(&self, max_pools: usize, warning_threshold: usize) {
        self.max_pools.store(max_pools, Ordering::SeqCst);
        self.pool_warning_threshold
            .store(warning_threshold, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Create (and start) a pool for a spec, subject to the pool limit.
    pub fn create_pool(&self, spec: PoolSpec) -> Result<Arc<ProcessPool>> {
        if let Some(existing) = self.pools.get(&spec.code) {
            return Ok(existing.clone());
        }

        let current = self.pools.len();
        let max = self.max_pools.load(Ordering::SeqCst);
        if current >= max {
            error!(
                pool_code = %spec.code,
                current = current,
                max_pools = max,
                "Pool limit reached - refusing to create pool"
            );
            self.warnings.raise(
                WarningCategory::PoolLimit,
                WarningSeverity::Error,
                format!(
                    "pool limit reached ({current}/{max}) - cannot create pool [{}]",
                    spec.code
                ),
                "Router",
            );
            return Err(RouterError::PoolLimit { current, max });
        }

        let threshold = self.pool_warning_threshold.load(Ordering::SeqCst);
        if current >= threshold {
            self.warnings.raise_throttled(
                "pool-count",
                WarningCategory::PoolLimit,
                WarningSeverity::Warn,
                format!("pool count {current} approaching limit {max} (threshold {threshold})"),
                "Router",
            );
        }

        let pool = Arc::new(ProcessPool::new(
            spec.clone(),
            self.mediator.clone(),
            self.completions.clone() as Arc<dyn CompletionSink>,
            self.warnings.clone(),
        ));
        pool.start();
        self.pools.insert(spec.code.clone(), pool.clone());
        info!(
            pool_code = %spec.code,
            concurrency = spec.concurrency,
            rate_limit = ?spec.rate_limit_per_minute,
            "Created process pool"
        );
        Ok(pool)
    }

    fn default_pool_spec() -> PoolSpec {
        PoolSpec {
            code: DEFAULT_POOL_CODE.to_string(),
            concurrency: DEFAULT_POOL_CONCURRENCY,
            rate_limit_per_minute: None,
        }
    }

    /// Reconcile the pool registry against a new configuration. Removed or
    /// changed pools drain out; new specs get fresh pools. Returns
    /// (created, removed, replaced).
    pub fn reconcile_pools(&self, specs: &[PoolSpec]) -> (usize, usize, usize) {
        let desired: HashMap<&str, &PoolSpec> =
            specs.iter().map(|s| (s.code.as_str(), s)).collect();

        let mut removed = 0;
        let mut replaced = 0;

        let existing: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for code in existing {
            let changed = match desired.get(code.as_str()) {
                None => {
                    // The lazily-created default pool survives syncs unless
                    // the config names it explicitly.
                    if code == DEFAULT_POOL_CODE {
                        continue;
                    }
                    removed += 1;
                    true
                }
                Some(spec) => {
                    let pool = match self.pools.get(&code) {
                        Some(p) => p.clone(),
                        None => continue,
                    };
                    let rate = spec.rate_limit_per_minute.filter(|r| *r > 0);
                    let differs = pool.concurrency() != spec.concurrency
                        || pool.rate_limit_per_minute() != rate;
                    if differs {
                        replaced += 1;
                    }
                    differs
                }
            };

            if changed {
                if let Some((code, pool)) = self.pools.remove(&code) {
                    info!(
                        pool_code = %code,
                        queue_size = pool.queue_size(),
                        active_workers = pool.active_workers(),
                        "Pool removed or changed in config - draining"
                    );
                    pool.drain();
                    self.draining_pools.insert(code, pool);
                }
            }
        }

        let mut created = 0;
        for spec in specs {
            if !self.pools.contains_key(&spec.code) && self.create_pool(spec.clone()).is_ok() {
                created += 1;
            }
        }

        (created, removed, replaced)
    }

    /// Sweep draining pools that finished their work. Called periodically.
    pub async fn sweep_draining_pools(&self) {
        let mut finished = Vec::new();
        for entry in self.draining_pools.iter() {
            if entry.value().is_fully_drained() {
                finished.push(entry.key().clone());
            }
        }
        for code in finished {
            if let Some((code, pool)) = self.draining_pools.remove(&code) {
                info!(pool_code = %code, "Draining pool finished - releasing");
                pool.shutdown().await;
            }
        }
    }

    pub fn pool_codes(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(|e| e.value().stats()).collect()
    }

    pub fn active_pool_count(&self) -> usize {
        self.pools.len()
    }

    // ------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------

    pub async fn register_consumer(&self, consumer: Arc<dyn QueueConsumer>) {
        let id = consumer.identifier().to_string();
        self.consumers.write().await.insert(id, consumer);
    }

    pub async fn deregister_consumer(&self, identifier: &str) -> Option<Arc<dyn QueueConsumer>> {
        self.consumers.write().await.remove(identifier)
    }

    pub async fn consumer_ids(&self) -> Vec<String> {
        self.consumers.read().await.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    pub fn in_pipeline_len(&self) -> usize {
        self.state.in_pipeline.len()
    }

    pub fn callbacks_len(&self) -> usize {
        self.state.callbacks.len()
    }

    pub fn is_in_pipeline(&self, id: &str) -> bool {
        self.state.in_pipeline.contains_key(id)
    }

    /// Leak audit, run every 30 seconds by the lifecycle manager.
    ///
    /// The pipeline can never legitimately hold more than every pool's queue
    /// plus every active worker; and the two maps track each other within a
    /// small settling window.
    pub fn audit_pipeline(&self) -> bool {
        let pipeline = self.state.in_pipeline.len();
        let callbacks = self.state.callbacks.len();

        let mut bound = 0usize;
        for entry in self.pools.iter() {
            bound += entry.value().queue_capacity() as usize
                + entry.value().active_workers() as usize;
        }
        for entry in self.draining_pools.iter() {
            bound += entry.value().queue_size() as usize
                + entry.value().active_workers() as usize;
        }

        let mut healthy = true;

        if pipeline > bound {
            warn!(
                in_pipeline = pipeline,
                bound = bound,
                "Pipeline map exceeds pool capacity bound - possible leak"
            );
            self.warnings.raise(
                WarningCategory::PipelineMapLeak,
                WarningSeverity::Warn,
                format!("in-pipeline map holds {pipeline} entries, capacity bound is {bound}"),
                "Router",
            );
            healthy = false;
        }

        if pipeline.abs_diff(callbacks) > MAP_SIZE_TOLERANCE {
            warn!(
                in_pipeline = pipeline,
                callbacks = callbacks,
                "Pipeline and callback maps diverged"
            );
            self.warnings.raise(
                WarningCategory::MapSizeMismatch,
                WarningSeverity::Warn,
                format!("pipeline map {pipeline} vs callback map {callbacks}"),
                "Router",
            );
            healthy = false;
        }

        healthy
    }

    /// Extend broker visibility for messages that have been in the pipeline
    /// long enough to risk their receipt expiring mid-mediation.
    pub async fn extend_visibility_for_long_running(&self) {
        let long_running: Vec<String> = self
            .state
            .in_pipeline
            .iter()
            .filter(|e| e.value().elapsed_seconds() >= VISIBILITY_EXTENSION_THRESHOLD_SECONDS)
            .map(|e| e.key().clone())
            .collect();

        for id in long_running {
            let callback = self.state.callbacks.get(&id).map(|e| e.value().clone());
            if let Some(callback) = callback {
                debug!(message_id = %id, "Extending visibility for long-running message");
                callback.extend_visibility(VISIBILITY_EXTENSION_SECONDS).await;
            }
        }
    }

    /// Refresh router and pool gauges from current state.
    pub fn refresh_gauges(&self) {
        router_metrics::set_router_gauges(
            self.in_pipeline_len(),
            self.callbacks_len(),
            self.pools.len(),
        );
        for entry in self.pools.iter() {
            router_metrics::set_pool_gauges(&entry.value().stats());
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Graceful shutdown: stop intake, drain in-flight work, settle whatever
    /// survives the drain window.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Router shutting down");

        // 1. No new messages enter.
        {
            let consumers = self.consumers.read().await;
            for consumer in consumers.values() {
                consumer.stop().await;
            }
        }

        // 2. Complete accepted work.
        for entry in self.pools.iter() {
            entry.value().drain();
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while Instant::now() < deadline {
            let all_drained = self.pools.iter().all(|e| e.value().is_fully_drained())
                && self.draining_pools.iter().all(|e| e.value().is_fully_drained());
            if all_drained {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        // 3. Anything still tracked is a crashed worker or a drain timeout:
        //    nack so the broker redelivers.
        let stragglers: Vec<String> = self
            .state
            .in_pipeline
            .iter()
            .map(|e| e.key().clone())
            .collect();
        if !stragglers.is_empty() {
            warn!(
                remaining = stragglers.len(),
                "Messages still in pipeline after drain - nacking"
            );
            self.warnings.raise(
                WarningCategory::ShutdownCleanupErrors,
                WarningSeverity::Warn,
                format!(
                    "{} messages still in pipeline after drain window",
                    stragglers.len()
                ),
                "Router",
            );
            for id in stragglers {
                if let Some(callback) = self.state.take(&id) {
                    callback.nack(Some(DEFAULT_NACK_DELAY_SECONDS)).await;
                }
            }
        }

        // 4. Final snapshot, then tear the pools down.
        self.state.in_pipeline.clear();
        self.state.callbacks.clear();
        self.refresh_gauges();

        let all_pools: Vec<Arc<ProcessPool>> = self
            .pools
            .iter()
            .chain(self.draining_pools.iter())
            .map(|e| e.value().clone())
            .collect();
        for pool in all_pools {
            pool.shutdown().await;
        }

        info!("Router shutdown complete");
    }
}

impl MessageRouter for Router {
    fn route_message(
        &self,
        message: MessagePointer,
        callback: Arc<dyn MessageCallback>,
    ) -> RouteDecision {
        if !self.running.load(Ordering::SeqCst) {
            return RouteDecision::Rejected;
        }

        let id = message.id.clone();

        // Deduplication gate: the pipeline entry is the claim on this id.
        match self.state.in_pipeline.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(message_id = %id, "Duplicate id already in pipeline");
                return RouteDecision::Duplicate;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(PipelineEntry::new(message.clone()));
            }
        }
        self.state.callbacks.insert(id.clone(), callback);

        let pool = match self.pools.get(&message.pool_code) {
            Some(pool) => pool.clone(),
            None => {
                warn!(
                    message_id = %id,
                    pool_code = %message.pool_code,
                    "Unknown pool code - using default pool"
                );
                self.warnings.raise_throttled(
                    &format!("unknown-pool:{}", message.pool_code),
                    WarningCategory::Routing,
                    WarningSeverity::Warn,
                    format!(
                        "unknown pool code [{}], routing to [{}]",
                        message.pool_code, DEFAULT_POOL_CODE
                    ),
                    "Router",
                );
                match self.create_pool(Self::default_pool_spec()) {
                    Ok(pool) => pool,
                    Err(e) => {
                        error!(message_id = %id, error = %e, "Cannot create default pool");
                        self.state.take(&id);
                        return RouteDecision::Rejected;
                    }
                }
            }
        };

        if pool.submit(message) {
            RouteDecision::Accepted
        } else {
            // The caller defers the broker message; our claim is withdrawn.
            self.state.take(&id);
            self.warnings.raise_throttled(
                &format!("queue-full:{}", pool.pool_code()),
                WarningCategory::QueueFull,
                WarningSeverity::Warn,
                format!("pool [{}] rejected message: queue full", pool.pool_code()),
                "Router",
            );
            RouteDecision::Rejected
        }
    }
}
