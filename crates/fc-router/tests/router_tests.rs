//! Router tests: deduplication, pool selection, pipeline-map hygiene,
//! exactly-once settlement and shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fc_common::{
    MediationOutcome, MediationType, MessageCallback, MessagePointer, MessageRouter, PoolSpec,
    RouteDecision, WarningCategory,
};
use fc_router::{Mediator, Router, RouterError, WarningSink, DEFAULT_POOL_CODE};

struct MockMediator {
    call_count: AtomicU32,
    delay: Duration,
    /// When set, mediation parks here until the gate opens.
    gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl MockMediator {
    fn new() -> Self {
        Self {
            call_count: AtomicU32::new(0),
            delay: Duration::from_millis(10),
            gate: None,
        }
    }

    fn gated(gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            call_count: AtomicU32::new(0),
            delay: Duration::ZERO,
            gate: Some(gate),
        }
    }

    fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Mediator for MockMediator {
    async fn mediate(&self, _message: &MessagePointer) -> MediationOutcome {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(ref gate) = self.gate {
            let _permit = gate.acquire().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        MediationOutcome::success(200)
    }
}

/// Consumer-side callback that counts its invocations.
#[derive(Default)]
struct MockCallback {
    acks: AtomicU32,
    nacks: AtomicU32,
}

impl MockCallback {
    fn ack_count(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    fn nack_count(&self) -> u32 {
        self.nacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageCallback for MockCallback {
    async fn ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    async fn nack(&self, _delay_seconds: Option<u32>) {
        self.nacks.fetch_add(1, Ordering::SeqCst);
    }
}

fn pointer(id: &str, pool_code: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: pool_code.to_string(),
        auth_token: None,
        mediation_type: MediationType::Http,
        mediation_target: "http://localhost:8080/hook".to_string(),
        message_group: None,
    }
}

fn spec(code: &str, concurrency: u32) -> PoolSpec {
    PoolSpec {
        code: code.to_string(),
        concurrency,
        rate_limit_per_minute: None,
    }
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
async fn accepted_message_settles_exactly_once() {
    let mediator = Arc::new(MockMediator::new());
    let router = Arc::new(Router::new(mediator.clone(), Arc::new(WarningSink::default())));
    router.create_pool(spec("P", 5)).unwrap();

    let callback = Arc::new(MockCallback::default());
    let decision = router.route_message(pointer("m-1", "P"), callback.clone());
    assert_eq!(decision, RouteDecision::Accepted);
    assert!(router.is_in_pipeline("m-1"));

    assert!(wait_until(5000, || callback.ack_count() == 1).await);
    assert_eq!(callback.nack_count(), 0);
    assert_eq!(mediator.call_count(), 1);

    // Terminal settlement empties both maps.
    assert!(wait_until(1000, || router.in_pipeline_len() == 0).await);
    assert_eq!(router.callbacks_len(), 0);
}

#[tokio::test]
async fn duplicate_id_is_routed_once() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mediator = Arc::new(MockMediator::gated(gate.clone()));
    let router = Arc::new(Router::new(mediator.clone(), Arc::new(WarningSink::default())));
    router.create_pool(spec("P", 5)).unwrap();

    let first = Arc::new(MockCallback::default());
    let second = Arc::new(MockCallback::default());

    assert_eq!(
        router.route_message(pointer("m-1", "P"), first.clone()),
        RouteDecision::Accepted
    );
    assert_eq!(
        router.route_message(pointer("m-1", "P"), second.clone()),
        RouteDecision::Duplicate
    );

    // Only one pipeline entry, the duplicate's callback was dropped.
    assert_eq!(router.in_pipeline_len(), 1);
    assert_eq!(router.callbacks_len(), 1);

    gate.add_permits(10);
    assert!(wait_until(5000, || first.ack_count() == 1).await);
    assert_eq!(mediator.call_count(), 1);
    assert_eq!(second.ack_count(), 0);
    assert_eq!(second.nack_count(), 0);
}

#[tokio::test]
async fn concurrent_duplicate_routes_yield_one_acceptance() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mediator = Arc::new(MockMediator::gated(gate.clone()));
    let router = Arc::new(Router::new(mediator.clone(), Arc::new(WarningSink::default())));
    router.create_pool(spec("P", 5)).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router.route_message(pointer("m-1", "P"), Arc::new(MockCallback::default()))
        }));
    }

    let mut accepted = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            RouteDecision::Accepted => accepted += 1,
            RouteDecision::Duplicate => duplicates += 1,
            RouteDecision::Rejected => panic!("unexpected rejection"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 7);

    gate.add_permits(10);
    assert!(wait_until(5000, || mediator.call_count() == 1).await);
}

#[tokio::test]
async fn unknown_pool_code_uses_default_pool_and_warns() {
    let mediator = Arc::new(MockMediator::new());
    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(mediator.clone(), warnings.clone()));

    let callback = Arc::new(MockCallback::default());
    let decision = router.route_message(pointer("m-1", "NOT-CONFIGURED"), callback.clone());
    assert_eq!(decision, RouteDecision::Accepted);

    assert!(router.pool_codes().contains(&DEFAULT_POOL_CODE.to_string()));
    assert!(!warnings.by_category(WarningCategory::Routing).is_empty());

    assert!(wait_until(5000, || callback.ack_count() == 1).await);
    assert_eq!(mediator.call_count(), 1);
}

#[tokio::test]
async fn queue_full_rejection_cleans_the_maps() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let mediator = Arc::new(MockMediator::gated(gate));
    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(mediator, warnings.clone()));
    router.create_pool(spec("P", 1)).unwrap();

    // Capacity floor is 500; the worker can hold at most a couple more.
    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..520 {
        match router.route_message(
            pointer(&format!("m-{i}"), "P"),
            Arc::new(MockCallback::default()),
        ) {
            RouteDecision::Accepted => accepted += 1,
            RouteDecision::Rejected => rejected += 1,
            RouteDecision::Duplicate => panic!("unexpected duplicate"),
        }
    }

    assert!(rejected > 0, "expected overflow rejections");
    // Rejected messages leave no trace in either map.
    assert_eq!(router.in_pipeline_len(), accepted);
    assert_eq!(router.callbacks_len(), accepted);
    assert!(!warnings.by_category(WarningCategory::QueueFull).is_empty());
}

#[tokio::test]
async fn pool_limit_refuses_creation() {
    let mediator = Arc::new(MockMediator::new());
    let warnings = Arc::new(WarningSink::default());
    let router = Router::with_limits(mediator, warnings.clone(), 1, 1);

    router.create_pool(spec("P1", 5)).unwrap();
    let refused = router.create_pool(spec("P2", 5));

    assert!(matches!(refused, Err(RouterError::PoolLimit { .. })));
    assert!(!warnings.by_category(WarningCategory::PoolLimit).is_empty());
    assert_eq!(router.active_pool_count(), 1);
}

#[tokio::test]
async fn reconcile_replaces_changed_pools_and_drops_removed() {
    let mediator = Arc::new(MockMediator::new());
    let router = Arc::new(Router::new(mediator, Arc::new(WarningSink::default())));

    router.reconcile_pools(&[spec("A", 5), spec("B", 5)]);
    assert_eq!(router.active_pool_count(), 2);

    // A changes concurrency, B disappears, C is new.
    let (created, removed, replaced) = router.reconcile_pools(&[spec("A", 10), spec("C", 5)]);
    assert_eq!(created, 2); // replacement A + new C
    assert_eq!(removed, 1);
    assert_eq!(replaced, 1);

    let codes = router.pool_codes();
    assert!(codes.contains(&"A".to_string()));
    assert!(codes.contains(&"C".to_string()));
    assert!(!codes.contains(&"B".to_string()));

    let stats = router.pool_stats();
    let pool_a = stats.iter().find(|s| s.pool_code == "A").unwrap();
    assert_eq!(pool_a.concurrency, 10);
}

#[tokio::test]
async fn audit_passes_on_healthy_pipeline() {
    let mediator = Arc::new(MockMediator::new());
    let warnings = Arc::new(WarningSink::default());
    let router = Arc::new(Router::new(mediator, warnings.clone()));
    router.create_pool(spec("P", 5)).unwrap();

    assert!(router.audit_pipeline());
    assert!(warnings
        .by_category(WarningCategory::PipelineMapLeak)
        .is_empty());
}

#[tokio::test]
async fn shutdown_settles_all_routed_messages() {
    let mediator = Arc::new(MockMediator::new());
    let router = Arc::new(Router::new(mediator, Arc::new(WarningSink::default())));
    router.create_pool(spec("P", 5)).unwrap();

    let callbacks: Vec<Arc<MockCallback>> =
        (0..5).map(|_| Arc::new(MockCallback::default())).collect();
    for (i, callback) in callbacks.iter().enumerate() {
        assert_eq!(
            router.route_message(pointer(&format!("m-{i}"), "P"), callback.clone()),
            RouteDecision::Accepted
        );
    }

    router.shutdown().await;

    for callback in &callbacks {
        assert_eq!(
            callback.ack_count() + callback.nack_count(),
            1,
            "every routed message settles exactly once across shutdown"
        );
    }
    assert_eq!(router.in_pipeline_len(), 0);
    assert_eq!(router.callbacks_len(), 0);

    // A stopped router accepts nothing.
    assert_eq!(
        router.route_message(pointer("late", "P"), Arc::new(MockCallback::default())),
        RouteDecision::Rejected
    );
}
