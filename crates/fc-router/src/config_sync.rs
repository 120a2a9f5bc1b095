//! Configuration sync.
//!
//! Fetches the immutable `RouterConfig` from the admin service and reconciles
//! pools and consumers against it, incrementally and without stopping the
//! world: removed or changed pools drain out on their own, consumers are
//! stopped or created independently.
//!
//! Startup blocks on the initial sync (with retries); a failure there aborts
//! the process. Steady-state failures keep the current configuration running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fc_common::{MessageRouter, QueueSpec, RouterConfig, WarningCategory, WarningSeverity};
use fc_queue::QueueConsumer;

use crate::router::Router;
use crate::warning::WarningSink;

/// Builds a consumer for a queue spec. The binary supplies an implementation
/// that knows how to construct SQS and AMQP consumers with real credentials.
#[async_trait]
pub trait ConsumerFactory: Send + Sync {
    async fn create_consumer(
        &self,
        spec: &QueueSpec,
        router: Arc<dyn MessageRouter>,
    ) -> crate::Result<Arc<dyn QueueConsumer>>;
}

#[derive(Debug, Clone)]
pub struct ConfigSyncConfig {
    pub config_url: String,
    pub request_timeout: Duration,
    /// Startup-only retry schedule.
    pub initial_retry_attempts: u32,
    pub retry_delay: Duration,
}

impl ConfigSyncConfig {
    pub fn new(config_url: impl Into<String>) -> Self {
        Self {
            config_url: config_url.into(),
            request_timeout: Duration::from_secs(30),
            initial_retry_attempts: 12,
            retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct ConfigSyncService {
    config: ConfigSyncConfig,
    http_client: reqwest::Client,
    router: Arc<Router>,
    consumer_factory: Arc<dyn ConsumerFactory>,
    warnings: Arc<WarningSink>,
    last_config_hash: Mutex<Option<u64>>,
    /// Interval comes from the fetched config and may change between syncs.
    sync_interval: Mutex<Duration>,
}

impl ConfigSyncService {
    pub fn new(
        config: ConfigSyncConfig,
        router: Arc<Router>,
        consumer_factory: Arc<dyn ConsumerFactory>,
        warnings: Arc<WarningSink>,
    ) -> crate::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            config,
            http_client,
            router,
            consumer_factory,
            warnings,
            last_config_hash: Mutex::new(None),
            sync_interval: Mutex::new(Duration::from_secs(300)),
        })
    }

    pub fn sync_interval(&self) -> Duration {
        *self.sync_interval.lock()
    }

    async fn fetch_once(&self) -> Result<RouterConfig, String> {
        let response = self
            .http_client
            .get(&self.config.config_url)
            .send()
            .await
            .map_err(|e| format!("config request failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!("config service returned {}", response.status()));
        }

        response
            .json::<RouterConfig>()
            .await
            .map_err(|e| format!("config response unparseable: {e}"))
    }

    async fn fetch_with_retries(&self, attempts: u32) -> Result<RouterConfig, String> {
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.fetch_once().await {
                Ok(config) => {
                    if attempt > 1 {
                        info!(attempt = attempt, "Fetched configuration after retries");
                    }
                    return Ok(config);
                }
                Err(e) => {
                    last_error = e;
                    if attempt < attempts {
                        warn!(
                            attempt = attempt,
                            max_attempts = attempts,
                            error = %last_error,
                            "Config fetch failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err(last_error)
    }

    fn config_hash(config: &RouterConfig) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        for pool in &config.pools {
            pool.hash(&mut hasher);
        }
        for queue in &config.queues {
            queue.hash(&mut hasher);
        }
        config.sync_interval_seconds.hash(&mut hasher);
        config.max_pools.hash(&mut hasher);
        config.pool_warning_threshold.hash(&mut hasher);
        hasher.finish()
    }

    /// Startup sync: retries, then applies. An error here means the router
    /// has no configuration to run with and the process should exit.
    pub async fn initial_sync(&self) -> Result<RouterConfig, String> {
        info!(url = %self.config.config_url, "Performing initial configuration sync");

        let config = match self
            .fetch_with_retries(self.config.initial_retry_attempts)
            .await
        {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "Initial configuration sync failed");
                self.warnings.raise(
                    WarningCategory::ConfigSyncFailed,
                    WarningSeverity::Critical,
                    format!("initial config sync failed: {e}"),
                    "ConfigSync",
                );
                return Err(e);
            }
        };

        self.apply(&config).await;
        *self.last_config_hash.lock() = Some(Self::config_hash(&config));

        info!(
            pools = config.pools.len(),
            queues = config.queues.len(),
            sync_interval_seconds = config.sync_interval_seconds,
            "Initial configuration applied"
        );
        Ok(config)
    }

    /// Steady-state sync: a failure keeps the current configuration.
    pub async fn sync(&self) -> bool {
        let config = match self.fetch_once().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Config sync failed - keeping current configuration");
                self.warnings.raise(
                    WarningCategory::ConfigSyncFailed,
                    WarningSeverity::Warn,
                    format!("config sync failed, keeping current config: {e}"),
                    "ConfigSync",
                );
                return false;
            }
        };

        let hash = Self::config_hash(&config);
        {
            let mut last = self.last_config_hash.lock();
            if *last == Some(hash) {
                debug!("Configuration unchanged");
                return true;
            }
            *last = Some(hash);
        }

        info!(
            pools = config.pools.len(),
            queues = config.queues.len(),
            "Configuration changed - reconciling"
        );
        self.apply(&config).await;
        true
    }

    async fn apply(&self, config: &RouterConfig) {
        self.router
            .set_pool_limits(config.max_pools, config.pool_warning_threshold);
        *self.sync_interval.lock() = Duration::from_secs(config.sync_interval_seconds.max(1));

        let (created, removed, replaced) = self.router.reconcile_pools(&config.pools);

        let (consumers_created, consumers_removed) = self.reconcile_consumers(config).await;

        info!(
            pools_created = created,
            pools_removed = removed,
            pools_replaced = replaced,
            consumers_created = consumers_created,
            consumers_removed = consumers_removed,
            active_pools = self.router.active_pool_count(),
            "Configuration reconciled"
        );
    }

    async fn reconcile_consumers(&self, config: &RouterConfig) -> (usize, usize) {
        let desired: std::collections::HashMap<&str, &QueueSpec> = config
            .queues
            .iter()
            .map(|q| (q.identifier.as_str(), q))
            .collect();

        let mut removed = 0;
        for id in self.router.consumer_ids().await {
            if !desired.contains_key(id.as_str()) {
                if let Some(consumer) = self.router.deregister_consumer(&id).await {
                    info!(queue = %id, "Stopping consumer for removed queue");
                    consumer.stop().await;
                    removed += 1;
                }
            }
        }

        let mut created = 0;
        let existing = self.router.consumer_ids().await;
        for spec in &config.queues {
            if existing.iter().any(|id| id == &spec.identifier) {
                continue;
            }
            let router: Arc<dyn MessageRouter> = self.router.clone();
            match self.consumer_factory.create_consumer(spec, router).await {
                Ok(consumer) => {
                    consumer.start().await;
                    self.router.register_consumer(consumer).await;
                    info!(queue = %spec.identifier, kind = ?spec.kind, "Consumer created");
                    created += 1;
                }
                Err(e) => {
                    error!(queue = %spec.identifier, error = %e, "Failed to create consumer");
                    self.warnings.raise(
                        WarningCategory::ConfigSyncFailed,
                        WarningSeverity::Error,
                        format!("failed to create consumer for [{}]: {e}", spec.identifier),
                        "ConfigSync",
                    );
                }
            }
        }

        (created, removed)
    }
}

/// Background task: re-sync on the interval carried by the configuration
/// itself, until shutdown.
pub fn spawn_config_sync_task(
    service: Arc<ConfigSyncService>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        loop {
            let interval = service.sync_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    debug!("Running scheduled configuration sync");
                    service.sync().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Config sync task shutting down");
                    break;
                }
            }
        }
    })
}
