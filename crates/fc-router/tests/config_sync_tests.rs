//! ConfigSync tests: fetch, initial-sync failure, incremental reconcile of
//! pools and consumers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fc_common::{
    MediationOutcome, MessagePointer, MessageRouter, QueueSpec, WarningCategory,
};
use fc_queue::QueueConsumer;
use fc_router::{
    ConfigSyncConfig, ConfigSyncService, ConsumerFactory, Mediator, Router, WarningSink,
};

struct NoopMediator;

#[async_trait]
impl Mediator for NoopMediator {
    async fn mediate(&self, _message: &MessagePointer) -> MediationOutcome {
        MediationOutcome::success(200)
    }
}

/// Consumer stub that records lifecycle transitions.
struct StubConsumer {
    identifier: String,
    started: AtomicBool,
    stopped: AtomicBool,
}

#[async_trait]
impl QueueConsumer for StubConsumer {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct StubFactory {
    created: AtomicU32,
}

#[async_trait]
impl ConsumerFactory for StubFactory {
    async fn create_consumer(
        &self,
        spec: &QueueSpec,
        _router: Arc<dyn MessageRouter>,
    ) -> fc_router::Result<Arc<dyn QueueConsumer>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubConsumer {
            identifier: spec.identifier.clone(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }))
    }
}

fn service_for(
    url: String,
    router: Arc<Router>,
    factory: Arc<StubFactory>,
    warnings: Arc<WarningSink>,
) -> ConfigSyncService {
    let mut config = ConfigSyncConfig::new(url);
    config.initial_retry_attempts = 2;
    config.retry_delay = Duration::from_millis(20);
    ConfigSyncService::new(config, router, factory, warnings).unwrap()
}

fn config_body(pool_concurrency: u32, queues: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "pools": [
            { "code": "P1", "concurrency": pool_concurrency, "rateLimitPerMinute": null }
        ],
        "queues": queues.iter().map(|q| serde_json::json!({
            "identifier": q,
            "connections": 1,
            "kind": "SQS_LIKE",
            "endpoint": format!("https://sqs.test/{q}")
        })).collect::<Vec<_>>(),
        "syncIntervalSeconds": 60,
        "maxPools": 100,
        "poolWarningThreshold": 50
    })
}

#[tokio::test]
async fn initial_sync_applies_pools_and_consumers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config_body(10, &["orders"])))
        .mount(&server)
        .await;

    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(Arc::new(NoopMediator), warnings.clone()));
    let factory = Arc::new(StubFactory::default());
    let service = service_for(
        format!("{}/config", server.uri()),
        router.clone(),
        factory.clone(),
        warnings,
    );

    let config = service.initial_sync().await.unwrap();
    assert_eq!(config.pools.len(), 1);
    assert_eq!(config.sync_interval_seconds, 60);

    assert!(router.pool_codes().contains(&"P1".to_string()));
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    assert_eq!(router.consumer_ids().await, vec!["orders".to_string()]);
    assert_eq!(service.sync_interval(), Duration::from_secs(60));
}

#[tokio::test]
async fn initial_sync_failure_is_fatal_and_critical() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(Arc::new(NoopMediator), warnings.clone()));
    let service = service_for(
        format!("{}/config", server.uri()),
        router,
        Arc::new(StubFactory::default()),
        warnings.clone(),
    );

    assert!(service.initial_sync().await.is_err());
    assert!(warnings.has_critical());
    assert!(!warnings
        .by_category(WarningCategory::ConfigSyncFailed)
        .is_empty());
}

#[tokio::test]
async fn steady_state_failure_keeps_current_config() {
    let server = MockServer::start().await;
    let ok = Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config_body(10, &["orders"])))
        .expect(1)
        .named("first fetch succeeds")
        .mount_as_scoped(&server)
        .await;

    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(Arc::new(NoopMediator), warnings.clone()));
    let factory = Arc::new(StubFactory::default());
    let service = service_for(
        format!("{}/config", server.uri()),
        router.clone(),
        factory,
        warnings.clone(),
    );

    service.initial_sync().await.unwrap();
    drop(ok);

    // Next fetch fails; pools and consumers stay as they are.
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    assert!(!service.sync().await);
    assert!(router.pool_codes().contains(&"P1".to_string()));
    assert_eq!(router.consumer_ids().await, vec!["orders".to_string()]);
    assert!(!warnings
        .by_category(WarningCategory::ConfigSyncFailed)
        .is_empty());
}

#[tokio::test]
async fn changed_config_reconciles_pools_and_consumers() {
    let server = MockServer::start().await;
    let first = Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config_body(10, &["orders"])))
        .mount_as_scoped(&server)
        .await;

    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(Arc::new(NoopMediator), warnings.clone()));
    let factory = Arc::new(StubFactory::default());
    let service = service_for(
        format!("{}/config", server.uri()),
        router.clone(),
        factory.clone(),
        warnings,
    );

    service.initial_sync().await.unwrap();
    drop(first);

    // Pool concurrency changes and the queue set moves from orders to refunds.
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config_body(20, &["refunds"])))
        .mount(&server)
        .await;

    assert!(service.sync().await);

    let stats = router.pool_stats();
    let p1 = stats.iter().find(|s| s.pool_code == "P1").unwrap();
    assert_eq!(p1.concurrency, 20);

    assert_eq!(router.consumer_ids().await, vec!["refunds".to_string()]);
    assert_eq!(factory.created.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unchanged_config_is_not_reapplied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(config_body(10, &["orders"])))
        .mount(&server)
        .await;

    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(Arc::new(NoopMediator), warnings.clone()));
    let factory = Arc::new(StubFactory::default());
    let service = service_for(
        format!("{}/config", server.uri()),
        router.clone(),
        factory.clone(),
        warnings,
    );

    service.initial_sync().await.unwrap();
    assert!(service.sync().await);

    // Same hash: the consumer was built exactly once.
    assert_eq!(factory.created.load(Ordering::SeqCst), 1);
}
