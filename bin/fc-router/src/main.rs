//! FlowCatalyst router daemon.
//!
//! Long-running process: fetches the router configuration from the admin
//! service, consumes messages from the configured queues and dispatches them
//! through the processing pools. Exits with code 1 when the initial
//! configuration cannot be fetched. SIGTERM/SIGINT trigger a graceful drain.
//!
//! Environment:
//! - `FLOWCATALYST_CONFIG_URL` (required): RouterConfig endpoint
//! - `FLOWCATALYST_SIGNING_SECRET`: enables webhook signature headers
//! - `MEDIATION_TIMEOUT_SECONDS`: mediator timeout (default 30)
//! - `METRICS_PORT`: Prometheus exposition port (default 9090)
//! - `SQS_ENDPOINT_URL`: endpoint override for local development
//! - AWS credentials/region from the standard SDK variables

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info};

use fc_common::{MessageRouter, QueueKind, QueueSpec};
use fc_queue::amqp::{AmqpConsumer, AmqpConsumerConfig};
use fc_queue::sqs::{SqsConsumer, SqsConsumerConfig};
use fc_queue::QueueConsumer;
use fc_router::{
    ConfigSyncConfig, ConfigSyncService, ConsumerFactory, HttpMediatorConfig, LifecycleConfig,
    LifecycleManager, MediatorRegistry, Router, WarningSink, WarningSinkConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    fc_common::logging::init_logging("fc-router");

    info!("Starting FlowCatalyst message router");

    install_metrics_recorder()?;

    let warnings = Arc::new(WarningSink::new(WarningSinkConfig::default()));

    let mediator_config = HttpMediatorConfig {
        timeout: Duration::from_secs(env_u64("MEDIATION_TIMEOUT_SECONDS", 30)),
        signing_secret: std::env::var("FLOWCATALYST_SIGNING_SECRET").ok(),
        ..Default::default()
    };
    let mediator = Arc::new(
        MediatorRegistry::with_http(mediator_config).context("failed to build mediator")?,
    );

    let router = Arc::new(Router::new(mediator, warnings.clone()));

    let sqs_client = build_sqs_client().await;
    let factory = Arc::new(RouterConsumerFactory { sqs_client });

    let config_url = std::env::var("FLOWCATALYST_CONFIG_URL")
        .context("FLOWCATALYST_CONFIG_URL is required")?;
    let config_sync = Arc::new(
        ConfigSyncService::new(
            ConfigSyncConfig::new(config_url),
            router.clone(),
            factory,
            warnings.clone(),
        )
        .context("failed to build config sync service")?,
    );

    // The router cannot run without a configuration: a failed initial sync
    // is fatal by design.
    if let Err(e) = config_sync.initial_sync().await {
        error!(error = %e, "Initial configuration sync failed - exiting");
        anyhow::bail!("initial config sync failed: {e}");
    }

    let lifecycle = LifecycleManager::start_with_config_sync(
        router.clone(),
        warnings.clone(),
        LifecycleConfig::default(),
        config_sync,
    );

    info!("FlowCatalyst router running");
    shutdown_signal().await;
    info!("Shutdown signal received");

    lifecycle.shutdown();
    router.shutdown().await;

    info!("FlowCatalyst router stopped");
    Ok(())
}

fn install_metrics_recorder() -> Result<()> {
    let port: u16 = env_u64("METRICS_PORT", 9090) as u16;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("failed to install Prometheus recorder")?;
    info!(port = port, "Prometheus metrics listener started");
    Ok(())
}

async fn build_sqs_client() -> aws_sdk_sqs::Client {
    let base = aws_config::defaults(aws_config::BehaviorVersion::latest());
    let config = match std::env::var("SQS_ENDPOINT_URL") {
        Ok(endpoint) if !endpoint.is_empty() => {
            info!(endpoint = %endpoint, "Using SQS endpoint override");
            base.endpoint_url(endpoint).load().await
        }
        _ => base.load().await,
    };
    aws_sdk_sqs::Client::new(&config)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Builds consumers from queue specs as config sync demands them.
struct RouterConsumerFactory {
    sqs_client: aws_sdk_sqs::Client,
}

#[async_trait]
impl ConsumerFactory for RouterConsumerFactory {
    async fn create_consumer(
        &self,
        spec: &QueueSpec,
        router: Arc<dyn MessageRouter>,
    ) -> fc_router::Result<Arc<dyn QueueConsumer>> {
        match spec.kind {
            QueueKind::SqsLike => {
                let config = SqsConsumerConfig::new(spec.endpoint.clone(), spec.identifier.clone())
                    .with_connections(spec.connections)
                    .with_visibility_timeout(spec.visibility_timeout_seconds as i32);
                Ok(Arc::new(SqsConsumer::new(
                    self.sqs_client.clone(),
                    config,
                    router,
                )))
            }
            QueueKind::Amqp => {
                let config =
                    AmqpConsumerConfig::new(spec.endpoint.clone(), spec.identifier.clone())
                        .with_connections(spec.connections);
                Ok(Arc::new(AmqpConsumer::new(config, router)))
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
