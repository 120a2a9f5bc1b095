//! End-to-end routing through the real HTTP mediator against a stub target:
//! wire-format parsing, routing, mediation, settlement.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fc_common::{
    MessageCallback, MessagePointer, MessageRouter, PoolSpec, RouteDecision,
    DEFAULT_NACK_DELAY_SECONDS,
};
use fc_router::{HttpMediatorConfig, MediatorRegistry, Router, WarningSink};

#[derive(Default)]
struct RecordingCallback {
    acks: AtomicU32,
    nacks: parking_lot::Mutex<Vec<Option<u32>>>,
}

impl RecordingCallback {
    fn ack_count(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    fn nack_delays(&self) -> Vec<Option<u32>> {
        self.nacks.lock().clone()
    }
}

#[async_trait]
impl MessageCallback for RecordingCallback {
    async fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(&self, delay_seconds: Option<u32>) {
        self.nacks.lock().push(delay_seconds);
    }
}

fn build_router() -> Arc<Router> {
    let mediator = Arc::new(
        MediatorRegistry::with_http(HttpMediatorConfig {
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            signing_secret: None,
        })
        .unwrap(),
    );
    let router = Arc::new(Router::new(mediator, Arc::new(WarningSink::default())));
    router
        .create_pool(PoolSpec {
            code: "P".to_string(),
            concurrency: 5,
            rate_limit_per_minute: None,
        })
        .unwrap();
    router
}

fn wire_pointer(id: &str, target: &str) -> MessagePointer {
    // Through the same wire format consumers parse.
    let body = format!(
        r#"{{"id":"{id}","poolCode":"P","mediationType":"HTTP","mediationTarget":"{target}"}}"#
    );
    serde_json::from_str(&body).unwrap()
}

async fn wait_until(deadline_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn happy_path_acks_and_empties_the_pipeline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let router = build_router();
    let callback = Arc::new(RecordingCallback::default());

    let decision = router.route_message(
        wire_pointer("m1", &format!("{}/ok", server.uri())),
        callback.clone(),
    );
    assert_eq!(decision, RouteDecision::Accepted);

    assert!(wait_until(5000, || callback.ack_count() == 1).await);
    assert!(callback.nack_delays().is_empty());
    assert_eq!(router.in_pipeline_len(), 0);
    assert_eq!(router.callbacks_len(), 0);
}

#[tokio::test]
async fn server_error_nacks_then_redelivery_succeeds() {
    let server = MockServer::start().await;

    // First delivery hits a 500.
    let failing = Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount_as_scoped(&server)
        .await;

    let router = build_router();
    let target = format!("{}/flaky", server.uri());

    let first = Arc::new(RecordingCallback::default());
    router.route_message(wire_pointer("m1", &target), first.clone());
    assert!(wait_until(5000, || !first.nack_delays().is_empty()).await);
    assert_eq!(first.nack_delays(), vec![Some(DEFAULT_NACK_DELAY_SECONDS)]);
    assert_eq!(router.in_pipeline_len(), 0);
    drop(failing);

    // The broker redelivers after the visibility delay; the target recovered.
    Mock::given(method("POST"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let second = Arc::new(RecordingCallback::default());
    let decision = router.route_message(wire_pointer("m1", &target), second.clone());
    assert_eq!(decision, RouteDecision::Accepted, "id is free after settlement");
    assert!(wait_until(5000, || second.ack_count() == 1).await);
}

#[tokio::test]
async fn duplicate_delivery_while_in_flight_is_not_mediated_twice() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .expect(1)
        .mount(&server)
        .await;

    let router = build_router();
    let target = format!("{}/slow", server.uri());

    let original = Arc::new(RecordingCallback::default());
    let duplicate = Arc::new(RecordingCallback::default());

    assert_eq!(
        router.route_message(wire_pointer("m1", &target), original.clone()),
        RouteDecision::Accepted
    );
    assert_eq!(
        router.route_message(wire_pointer("m1", &target), duplicate.clone()),
        RouteDecision::Duplicate
    );

    assert!(wait_until(5000, || original.ack_count() == 1).await);
    // The mock's expect(1) verifies a single mediation on drop.
    assert_eq!(duplicate.ack_count(), 0);
}

#[tokio::test]
async fn poison_target_is_acked_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let router = build_router();
    let callback = Arc::new(RecordingCallback::default());
    router.route_message(
        wire_pointer("m1", &format!("{}/gone", server.uri())),
        callback.clone(),
    );

    assert!(wait_until(5000, || callback.ack_count() == 1).await);
    assert!(callback.nack_delays().is_empty());
}
