//! ProcessPool - bounded queue plus worker pool for one pool code.
//!
//! Admission is bounded by the queue capacity check in `submit`; workers gate
//! each message through the group tracker, the concurrency semaphore and the
//! rate limiter, in that order, then hand it to the mediator and settle the
//! result through the completion sink the router injected.
//!
//! Messages whose group is busy are parked on a per-group wait list instead
//! of blocking a worker; the settling worker promotes the next waiter when it
//! releases the slot. Parking and promotion happen under the queue lock, so
//! within-group FIFO order is preserved. Parked messages keep counting
//! against queue capacity.
//!
//! The semaphore is acquired after the queue pop, so in-flight plus queued
//! may briefly exceed capacity + concurrency; admission stays bounded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use fc_common::{
    MediationResult, MessagePointer, PoolSpec, PoolStats, WarningCategory, WarningSeverity,
    DEFAULT_NACK_DELAY_SECONDS, FAST_FAIL_DELAY_SECONDS,
};

use crate::group::GroupTracker;
use crate::limiter::PoolRateLimiter;
use crate::mediator::Mediator;
use crate::router_metrics;
use crate::warning::WarningSink;

/// Completion channel from pool workers back to the router. The router
/// implementation removes the pipeline entries and forwards to the consumer
/// callback it stored at routing time.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn ack(&self, message: &MessagePointer);
    async fn nack(&self, message: &MessagePointer, delay_seconds: Option<u32>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Running,
    Draining,
    Drained,
    Shutdown,
}

const STATE_RUNNING: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_DRAINED: u8 = 2;
const STATE_SHUTDOWN: u8 = 3;

/// Fallback wake interval for idle workers; covers a lost notify permit.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after a semaphore miss so a permit-starved worker does not spin.
const PERMIT_BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// Ready queue plus per-group wait lists, mutated under one lock so group
/// parking and promotion are atomic with respect to each other.
struct PoolQueue {
    ready: VecDeque<MessagePointer>,
    waiting: HashMap<String, VecDeque<MessagePointer>>,
}

pub struct ProcessPool {
    spec: PoolSpec,
    capacity: u32,
    mediator: Arc<dyn Mediator>,
    completions: Arc<dyn CompletionSink>,
    warnings: Arc<WarningSink>,

    queue: Mutex<PoolQueue>,
    /// Ready plus parked messages; the capacity check reads this.
    queue_size: AtomicU32,
    work_available: Notify,

    semaphore: Arc<Semaphore>,
    groups: GroupTracker,
    limiter: PoolRateLimiter,

    state: AtomicU8,
    started: AtomicBool,
    /// Workers currently inside a mediation.
    active_workers: AtomicU32,
    /// Worker tasks that have not exited yet.
    live_workers: AtomicU32,
}

impl ProcessPool {
    pub fn new(
        spec: PoolSpec,
        mediator: Arc<dyn Mediator>,
        completions: Arc<dyn CompletionSink>,
        warnings: Arc<WarningSink>,
    ) -> Self {
        let capacity = spec.queue_capacity();
        let concurrency = spec.concurrency.max(1);
        let limiter = PoolRateLimiter::new(spec.rate_limit_per_minute);

        Self {
            spec,
            capacity,
            mediator,
            completions,
            warnings,
            queue: Mutex::new(PoolQueue {
                ready: VecDeque::new(),
                waiting: HashMap::new(),
            }),
            queue_size: AtomicU32::new(0),
            work_available: Notify::new(),
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            groups: GroupTracker::new(),
            limiter,
            state: AtomicU8::new(STATE_RUNNING),
            started: AtomicBool::new(false),
            active_workers: AtomicU32::new(0),
            live_workers: AtomicU32::new(0),
        }
    }

    /// Launch the worker tasks. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            pool_code = %self.spec.code,
            concurrency = self.spec.concurrency,
            rate_limit = ?self.spec.rate_limit_per_minute,
            queue_capacity = self.capacity,
            "Starting process pool"
        );

        for worker in 0..self.spec.concurrency.max(1) {
            self.spawn_worker(worker);
        }
    }

    /// Enqueue a message. Returns false when the pool is not running or the
    /// queue is at capacity; the caller then owns pipeline-map cleanup.
    pub fn submit(&self, message: MessagePointer) -> bool {
        if self.state() != PoolState::Running {
            debug!(
                pool_code = %self.spec.code,
                message_id = %message.id,
                state = ?self.state(),
                "Pool not accepting work"
            );
            return false;
        }

        if self.queue_size.load(Ordering::SeqCst) >= self.capacity {
            debug!(
                pool_code = %self.spec.code,
                message_id = %message.id,
                capacity = self.capacity,
                "Pool queue full"
            );
            return false;
        }

        self.queue.lock().ready.push_back(message);
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        self.work_available.notify_one();
        true
    }

    /// Stop accepting work; queued and in-flight messages run to completion.
    pub fn drain(&self) {
        if self
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_DRAINING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            info!(
                pool_code = %self.spec.code,
                queue_size = self.queue_size.load(Ordering::SeqCst),
                "Draining pool"
            );
            self.work_available.notify_waiters();
        }
    }

    /// Force termination: whatever is still queued or parked gets nacked
    /// with the default delay, workers exit.
    pub async fn shutdown(&self) {
        let previous = self.state.swap(STATE_SHUTDOWN, Ordering::SeqCst);
        if previous == STATE_SHUTDOWN {
            return;
        }

        info!(pool_code = %self.spec.code, "Shutting down pool");
        self.work_available.notify_waiters();

        let remaining: Vec<MessagePointer> = {
            let mut queue = self.queue.lock();
            let mut remaining: Vec<MessagePointer> = queue.ready.drain(..).collect();
            for (_, mut waiters) in queue.waiting.drain() {
                remaining.extend(waiters.drain(..));
            }
            remaining
        };

        for message in remaining {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            self.completions
                .nack(&message, Some(DEFAULT_NACK_DELAY_SECONDS))
                .await;
        }
    }

    /// True once nothing is queued, parked or mid-mediation.
    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            STATE_RUNNING => PoolState::Running,
            STATE_DRAINING => PoolState::Draining,
            STATE_DRAINED => PoolState::Drained,
            _ => PoolState::Shutdown,
        }
    }

    pub fn pool_code(&self) -> &str {
        &self.spec.code
    }

    pub fn concurrency(&self) -> u32 {
        self.spec.concurrency
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        self.limiter.rate_per_minute()
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn queue_capacity(&self) -> u32 {
        self.capacity
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_code: self.spec.code.clone(),
            concurrency: self.spec.concurrency,
            active_workers: self.active_workers(),
            queue_size: self.queue_size(),
            queue_capacity: self.capacity,
            message_group_count: self.groups.busy_count() as u32,
            rate_limit_per_minute: self.limiter.rate_per_minute(),
        }
    }

    fn spawn_worker(self: &Arc<Self>, worker: u32) {
        let pool = Arc::clone(self);
        pool.live_workers.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            loop {
                let run = std::panic::AssertUnwindSafe(pool.worker_loop(worker))
                    .catch_unwind()
                    .await;

                match run {
                    Ok(()) => break,
                    Err(_) => {
                        // A worker must never stay dead while the pool runs.
                        error!(
                            pool_code = %pool.spec.code,
                            worker = worker,
                            "Worker task panicked - restarting"
                        );
                        router_metrics::record_worker_panic(&pool.spec.code);
                        pool.warnings.raise(
                            WarningCategory::Mediation,
                            WarningSeverity::Error,
                            format!(
                                "worker {} in pool [{}] panicked and was restarted",
                                worker, pool.spec.code
                            ),
                            format!("ProcessPool:{}", pool.spec.code),
                        );
                        if matches!(pool.state(), PoolState::Shutdown | PoolState::Drained) {
                            break;
                        }
                    }
                }
            }

            if pool.live_workers.fetch_sub(1, Ordering::SeqCst) == 1 {
                pool.mark_drained_if_finished();
            }
            debug!(pool_code = %pool.spec.code, worker = worker, "Worker exited");
        });
    }

    /// Pop the next message whose group slot could be claimed. Heads of busy
    /// groups are parked onto their wait list, in queue order, and stay
    /// counted against capacity. Returns with the group slot held.
    fn next_message(&self) -> Option<MessagePointer> {
        let mut queue = self.queue.lock();
        while let Some(message) = queue.ready.pop_front() {
            match message.group().map(str::to_string) {
                None => {
                    self.queue_size.fetch_sub(1, Ordering::SeqCst);
                    return Some(message);
                }
                Some(group) => {
                    if self.groups.try_acquire(Some(group.as_str())) {
                        self.queue_size.fetch_sub(1, Ordering::SeqCst);
                        return Some(message);
                    }
                    queue.waiting.entry(group).or_default().push_back(message);
                }
            }
        }
        None
    }

    /// Release a group slot and promote its next waiter to the ready front.
    fn release_group_slot(&self, group: Option<&str>) {
        let Some(group) = group else { return };

        let mut guard = self.queue.lock();
        let queue = &mut *guard;
        self.groups.release(Some(group));

        let mut emptied = false;
        if let Some(waiters) = queue.waiting.get_mut(group) {
            if let Some(next) = waiters.pop_front() {
                queue.ready.push_front(next);
                self.work_available.notify_one();
            }
            emptied = waiters.is_empty();
        }
        if emptied {
            queue.waiting.remove(group);
        }
    }

    /// Put a claimed message back at the ready front with its slot released,
    /// without promoting a waiter past it. Used on a semaphore miss.
    fn put_back(&self, message: MessagePointer, group: Option<&str>) {
        let mut queue = self.queue.lock();
        self.groups.release(group);
        queue.ready.push_front(message);
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        self.work_available.notify_one();
    }

    async fn worker_loop(&self, worker: u32) {
        debug!(pool_code = %self.spec.code, worker = worker, "Worker started");

        loop {
            match self.state() {
                PoolState::Shutdown | PoolState::Drained => return,
                _ => {}
            }

            let message = match self.next_message() {
                Some(message) => message,
                None => {
                    // Draining with nothing ready: anything still parked is
                    // owned by the worker holding that group slot.
                    if self.state() == PoolState::Draining {
                        return;
                    }
                    tokio::select! {
                        _ = self.work_available.notified() => {}
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                    continue;
                }
            };

            let group = message.group().map(str::to_string);

            if matches!(self.state(), PoolState::Shutdown | PoolState::Drained) {
                self.completions
                    .nack(&message, Some(DEFAULT_NACK_DELAY_SECONDS))
                    .await;
                self.release_group_slot(group.as_deref());
                continue;
            }

            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.put_back(message, group.as_deref());
                    tokio::time::sleep(PERMIT_BUSY_BACKOFF).await;
                    continue;
                }
            };

            // Semaphore first, limiter second: a limiter miss gives
            // everything back and fast-fail nacks.
            if !self.limiter.try_acquire() {
                drop(permit);
                router_metrics::record_rate_limit_exceeded(&self.spec.code);
                self.warnings.raise_throttled(
                    &format!("rate-limit:{}", self.spec.code),
                    WarningCategory::RateLimit,
                    WarningSeverity::Warn,
                    format!("pool [{}] rate limit exceeded", self.spec.code),
                    format!("ProcessPool:{}", self.spec.code),
                );
                self.completions
                    .nack(&message, Some(FAST_FAIL_DELAY_SECONDS))
                    .await;
                self.release_group_slot(group.as_deref());
                continue;
            }

            self.active_workers.fetch_add(1, Ordering::SeqCst);

            let recovery_copy = message.clone();
            let processed = std::panic::AssertUnwindSafe(self.process_message(message))
                .catch_unwind()
                .await;

            if processed.is_err() {
                error!(
                    pool_code = %self.spec.code,
                    message_id = %recovery_copy.id,
                    "Panic while processing message - nacking"
                );
                router_metrics::record_worker_panic(&self.spec.code);
                self.completions
                    .nack(&recovery_copy, Some(DEFAULT_NACK_DELAY_SECONDS))
                    .await;
            }

            self.active_workers.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            self.release_group_slot(group.as_deref());
        }
    }

    /// Mediate one message and settle the outcome. The caller holds the
    /// group slot and a semaphore permit.
    async fn process_message(&self, message: MessagePointer) {
        let start = Instant::now();
        let outcome = self.mediator.mediate(&message).await;
        let duration = start.elapsed();

        router_metrics::record_mediation_duration(&self.spec.code, duration);
        router_metrics::record_message_processed(&self.spec.code, outcome.result.tag());

        match outcome.result {
            MediationResult::Success => {
                debug!(
                    pool_code = %self.spec.code,
                    message_id = %message.id,
                    duration_ms = duration.as_millis() as u64,
                    "Message processed"
                );
                self.completions.ack(&message).await;
            }
            MediationResult::ErrorClient | MediationResult::Invalid => {
                // Poison: acking is the only move that does not loop forever.
                warn!(
                    pool_code = %self.spec.code,
                    message_id = %message.id,
                    result = outcome.result.tag(),
                    status_code = ?outcome.status_code,
                    error = ?outcome.error,
                    "Permanent mediation failure - settling as poison"
                );
                self.warnings.raise(
                    WarningCategory::Mediation,
                    WarningSeverity::Warn,
                    format!(
                        "message [{}] settled as poison ({}): {}",
                        message.id,
                        outcome.result.tag(),
                        outcome.error.as_deref().unwrap_or("no detail")
                    ),
                    format!("ProcessPool:{}", self.spec.code),
                );
                self.completions.ack(&message).await;
            }
            MediationResult::RateLimited
            | MediationResult::ErrorServer
            | MediationResult::ErrorTimeout => {
                debug!(
                    pool_code = %self.spec.code,
                    message_id = %message.id,
                    result = outcome.result.tag(),
                    delay = outcome.nack_delay_seconds(),
                    "Transient mediation failure - nacking"
                );
                self.completions
                    .nack(&message, Some(outcome.nack_delay_seconds()))
                    .await;
            }
        }
    }

    fn mark_drained_if_finished(&self) {
        if self.queue_size.load(Ordering::SeqCst) == 0 {
            let _ = self.state.compare_exchange(
                STATE_DRAINING,
                STATE_DRAINED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}
