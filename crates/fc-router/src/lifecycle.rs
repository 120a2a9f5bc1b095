//! Lifecycle manager - background maintenance tasks for the router.
//!
//! All tasks listen on a shared broadcast channel and exit on shutdown:
//! pipeline leak audit, draining-pool sweep, warning cleanup, gauge refresh,
//! visibility extension for long-running messages, and (when configured) the
//! scheduled config sync.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config_sync::{spawn_config_sync_task, ConfigSyncService};
use crate::router::Router;
use crate::warning::WarningSink;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub leak_audit_interval: Duration,
    pub draining_sweep_interval: Duration,
    pub warning_cleanup_interval: Duration,
    pub gauge_refresh_interval: Duration,
    pub visibility_extension_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            leak_audit_interval: Duration::from_secs(30),
            draining_sweep_interval: Duration::from_secs(10),
            warning_cleanup_interval: Duration::from_secs(300),
            gauge_refresh_interval: Duration::from_secs(5),
            // Just under the visibility-extension threshold so extensions
            // land before receipts expire.
            visibility_extension_interval: Duration::from_secs(55),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(
        router: Arc<Router>,
        warnings: Arc<WarningSink>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Pipeline leak audit.
        Self::spawn_interval_task(
            "leak-audit",
            config.leak_audit_interval,
            shutdown_tx.clone(),
            {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.audit_pipeline();
                    }
                }
            },
        );

        // Draining-pool sweep.
        Self::spawn_interval_task(
            "draining-sweep",
            config.draining_sweep_interval,
            shutdown_tx.clone(),
            {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.sweep_draining_pools().await;
                    }
                }
            },
        );

        // Warning retention.
        Self::spawn_interval_task(
            "warning-cleanup",
            config.warning_cleanup_interval,
            shutdown_tx.clone(),
            {
                let warnings = warnings.clone();
                move || {
                    let warnings = warnings.clone();
                    async move {
                        warnings.cleanup();
                    }
                }
            },
        );

        // Gauge refresh.
        Self::spawn_interval_task(
            "gauge-refresh",
            config.gauge_refresh_interval,
            shutdown_tx.clone(),
            {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.refresh_gauges();
                    }
                }
            },
        );

        // Visibility extension for messages at risk of receipt expiry.
        Self::spawn_interval_task(
            "visibility-extension",
            config.visibility_extension_interval,
            shutdown_tx.clone(),
            {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.extend_visibility_for_long_running().await;
                    }
                }
            },
        );

        info!("Lifecycle manager started");
        Self { shutdown_tx }
    }

    /// Start the base tasks plus the scheduled config sync.
    pub fn start_with_config_sync(
        router: Arc<Router>,
        warnings: Arc<WarningSink>,
        config: LifecycleConfig,
        config_sync: Arc<ConfigSyncService>,
    ) -> Self {
        let lifecycle = Self::start(router, warnings, config);
        spawn_config_sync_task(config_sync, lifecycle.shutdown_tx.clone());
        lifecycle
    }

    fn spawn_interval_task<F, Fut>(
        name: &'static str,
        interval: Duration,
        shutdown_tx: broadcast::Sender<()>,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    _ = shutdown_rx.recv() => {
                        debug!(task = name, "Lifecycle task shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Signal every lifecycle task to stop.
    pub fn shutdown(&self) {
        info!("Lifecycle manager shutting down");
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
