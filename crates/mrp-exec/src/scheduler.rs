//! Map-phase scheduler.
//!
//! One driver task per shard runs that shard's attempt loop: wait for a
//! worker permit and governor clearance, execute under the per-shard timeout,
//! settle cost, persist the output, and on failure either back off and retry
//! or give up. Drivers never touch shared records; they send state events to
//! the coordinator, which owns the shard arena and validates every
//! transition against the shard state machine.
//!
//! Completion order is whatever the backend produces. Nothing here orders
//! outputs; `merge` does that from the arena afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mrp_core::hash::Digest;
use mrp_core::ir::{MapTask, Seed};
use mrp_core::record::{FailureClass, RunFailure, ShardError, ShardRecord, ShardState};
use mrp_store::{ArtifactStore, ContentType};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backend::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};
use crate::error::ExecError;
use crate::governor::{CostMeter, Governor};
use crate::metrics::{emit_span, now_ms};
use crate::retry::BackoffPolicy;

/// Store ref namespace mapping task keys to output digests.
pub const SHARD_CACHE_NS: &str = "shards";

#[derive(Debug, Clone)]
pub struct MapPhaseConfig {
    pub workers: usize,
    pub shard_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub cache: bool,
}

#[derive(Debug, Clone)]
pub struct MapPhaseOutcome {
    /// One record per task, in task (shard-id) order.
    pub records: Vec<ShardRecord>,
    pub failure: Option<RunFailure>,
}

#[derive(Debug)]
struct Completed {
    worker: String,
    exit_code: Option<i32>,
    stdout_digest: Option<Digest>,
    output_digest: Digest,
    package_digest: Option<Digest>,
    at: u64,
}

#[derive(Debug)]
enum ShardEvent {
    CacheHit {
        output_digest: Digest,
    },
    Dispatched {
        attempt: u32,
        at: u64,
    },
    Running,
    Succeeded(Completed),
    Failed {
        error: ShardError,
        worker: Option<String>,
        exit_code: Option<i32>,
        at: u64,
    },
    Retrying,
    PermanentlyFailed,
    Cancelled {
        at: u64,
    },
}

impl ShardEvent {
    fn target(&self) -> ShardState {
        match self {
            ShardEvent::CacheHit { .. } | ShardEvent::Succeeded(_) => ShardState::Succeeded,
            ShardEvent::Dispatched { .. } => ShardState::Dispatched,
            ShardEvent::Running => ShardState::Running,
            ShardEvent::Failed { .. } => ShardState::Failed,
            ShardEvent::Retrying => ShardState::Retrying,
            ShardEvent::PermanentlyFailed => ShardState::PermanentlyFailed,
            ShardEvent::Cancelled { .. } => ShardState::Cancelled,
        }
    }
}

/// Shard records indexed by canonical position.
#[derive(Debug)]
struct ShardArena {
    slots: Vec<ShardRecord>,
}

impl ShardArena {
    fn new(tasks: &[MapTask]) -> Self {
        Self {
            slots: tasks.iter().map(|t| ShardRecord::pending(t.shard_id)).collect(),
        }
    }

    fn apply(&mut self, idx: usize, event: ShardEvent) -> Result<ShardState, ExecError> {
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or_else(|| ExecError::Invalid(format!("event for unknown shard slot {idx}")))?;
        let to = event.target();
        if !slot.state.can_transition(to) {
            return Err(ExecError::Invalid(format!(
                "{}: illegal transition {:?} -> {:?}",
                slot.shard_id, slot.state, to
            )));
        }
        slot.state = to;
        match event {
            ShardEvent::CacheHit { output_digest } => {
                slot.cached = true;
                slot.output_digest = Some(output_digest);
            }
            ShardEvent::Dispatched { attempt, at } => {
                slot.attempt_count = attempt;
                slot.start_ts.get_or_insert(at);
            }
            ShardEvent::Running | ShardEvent::Retrying | ShardEvent::PermanentlyFailed => {}
            ShardEvent::Succeeded(done) => {
                slot.worker = Some(done.worker);
                slot.exit_code = done.exit_code;
                slot.stdout_digest = done.stdout_digest;
                slot.output_digest = Some(done.output_digest);
                slot.package_digest = done.package_digest;
                slot.end_ts = Some(done.at);
                slot.error = None;
            }
            ShardEvent::Failed {
                error,
                worker,
                exit_code,
                at,
            } => {
                if worker.is_some() {
                    slot.worker = worker;
                }
                slot.exit_code = exit_code;
                slot.error = Some(error);
                slot.end_ts = Some(at);
            }
            ShardEvent::Cancelled { at } => slot.end_ts = Some(at),
        }
        Ok(to)
    }
}

#[derive(Clone)]
struct Driver {
    executor: Arc<dyn ShardExecutor>,
    store: ArtifactStore,
    governor: Arc<Governor>,
    meter: Arc<dyn CostMeter>,
    permits: Arc<Semaphore>,
    backoff: BackoffPolicy,
    timeout: Duration,
    cache: bool,
    seed: Seed,
    events: mpsc::UnboundedSender<(usize, ShardEvent)>,
}

impl Driver {
    fn emit(&self, idx: usize, event: ShardEvent) {
        // The coordinator only stops listening when it is bailing out.
        let _ = self.events.send((idx, event));
    }

    fn cancelled(&self, idx: usize) {
        self.emit(idx, ShardEvent::Cancelled { at: now_ms() });
    }

    fn persist(&self, task: &MapTask, out: AttemptOutput) -> Result<Completed, AttemptError> {
        let storing = |e: mrp_store::StoreError| {
            AttemptError::retryable(format!("storing shard output: {e}")).on_worker(out.worker.clone())
        };
        let output_digest = self.store.put_json(&out.output).map_err(storing)?;
        let stdout_digest = match out.stdout.as_deref() {
            Some(stdout) => Some(
                self.store
                    .put_bytes(stdout.as_bytes(), ContentType::Text)
                    .map_err(storing)?,
            ),
            None => None,
        };
        if self.cache {
            self.store
                .set_ref(SHARD_CACHE_NS, &task.task_key.to_hex(), &output_digest)
                .map_err(storing)?;
        }
        Ok(Completed {
            worker: out.worker.clone(),
            exit_code: out.exit_code,
            stdout_digest,
            output_digest,
            package_digest: out.package_digest,
            at: now_ms(),
        })
    }

    async fn drive(self, idx: usize, task: MapTask) {
        let mut cancel = self.governor.signal();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return self.cancelled(idx),
                },
                _ = cancel.cancelled() => return self.cancelled(idx),
            };
            let estimate = self.meter.estimate(task.shard_id);
            if !self.governor.clearance(estimate).await {
                return self.cancelled(idx);
            }

            self.emit(idx, ShardEvent::Dispatched { attempt, at: now_ms() });
            emit_span(
                "shard.dispatch",
                &[("shard", task.shard_id.to_string()), ("attempt", attempt.to_string())],
            );
            self.emit(idx, ShardEvent::Running);

            let started = Instant::now();
            let ctx = AttemptContext {
                task: task.clone(),
                seed: self.seed,
                attempt,
            };
            let result = tokio::select! {
                r = tokio::time::timeout(self.timeout, self.executor.execute(ctx)) => match r {
                    Ok(r) => r,
                    Err(_) => Err(AttemptError::retryable(format!(
                        "shard timed out after {} ms",
                        self.timeout.as_millis()
                    ))),
                },
                _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            };
            let cost = self.meter.observe(task.shard_id, attempt, started.elapsed());
            self.governor.settle(estimate, cost);
            drop(permit);

            let err = match result.and_then(|out| self.persist(&task, out)) {
                Ok(done) => {
                    debug!(shard = %task.shard_id, attempt, worker = %done.worker, output = %done.output_digest.short(), "shard succeeded");
                    return self.emit(idx, ShardEvent::Succeeded(done));
                }
                Err(AttemptError::Cancelled) => return self.cancelled(idx),
                Err(err) => err,
            };

            let class = err.class();
            self.emit(
                idx,
                ShardEvent::Failed {
                    error: ShardError {
                        class,
                        message: err.to_string(),
                        attempt,
                    },
                    worker: err.worker().map(str::to_string),
                    exit_code: err.exit_code(),
                    at: now_ms(),
                },
            );
            if cancel.is_cancelled() {
                return self.cancelled(idx);
            }
            if !self.backoff.should_retry(class, attempt) {
                warn!(shard = %task.shard_id, attempt, ?class, error = %err, "shard failed permanently");
                return self.emit(idx, ShardEvent::PermanentlyFailed);
            }

            let delay = self.backoff.delay(attempt);
            warn!(shard = %task.shard_id, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying shard");
            self.emit(idx, ShardEvent::Retrying);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return self.cancelled(idx),
            }
        }
    }
}

pub struct MapScheduler {
    executor: Arc<dyn ShardExecutor>,
    store: ArtifactStore,
    governor: Arc<Governor>,
    meter: Arc<dyn CostMeter>,
    cfg: MapPhaseConfig,
}

impl MapScheduler {
    pub fn new(
        executor: Arc<dyn ShardExecutor>,
        store: ArtifactStore,
        governor: Arc<Governor>,
        meter: Arc<dyn CostMeter>,
        cfg: MapPhaseConfig,
    ) -> Self {
        Self {
            executor,
            store,
            governor,
            meter,
            cfg,
        }
    }

    fn cached_output(&self, task: &MapTask) -> Result<Option<Digest>, ExecError> {
        if !self.cfg.cache {
            return Ok(None);
        }
        match self.store.get_ref(SHARD_CACHE_NS, &task.task_key.to_hex())? {
            Some(digest) if self.store.has(&digest)? => Ok(Some(digest)),
            _ => Ok(None),
        }
    }

    pub async fn run(&self, tasks: &[MapTask], seed: Seed) -> Result<MapPhaseOutcome, ExecError> {
        let mut arena = ShardArena::new(tasks);
        let (events, mut rx) = mpsc::unbounded_channel();
        let driver = Driver {
            executor: self.executor.clone(),
            store: self.store.clone(),
            governor: self.governor.clone(),
            meter: self.meter.clone(),
            permits: Arc::new(Semaphore::new(self.cfg.workers.max(1))),
            backoff: self.cfg.backoff.clone(),
            timeout: self.cfg.shard_timeout,
            cache: self.cfg.cache,
            seed,
            events,
        };

        let mut drivers = JoinSet::new();
        let mut cached = 0usize;
        for (idx, task) in tasks.iter().enumerate() {
            if let Some(output_digest) = self.cached_output(task)? {
                arena.apply(idx, ShardEvent::CacheHit { output_digest })?;
                cached += 1;
                continue;
            }
            drivers.spawn(driver.clone().drive(idx, task.clone()));
        }
        drop(driver);
        info!(
            backend = %self.executor.backend(),
            shards = tasks.len(),
            cached,
            workers = self.cfg.workers,
            "map phase dispatching"
        );

        let mut failure = None;
        let deadline = self.governor.deadline();
        tokio::pin!(deadline);
        let mut expired = false;
        loop {
            let (idx, event) = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = &mut deadline, if !expired => {
                    expired = true;
                    continue;
                }
            };
            if arena.apply(idx, event)? == ShardState::PermanentlyFailed && failure.is_none() {
                let slot = &arena.slots[idx];
                let (classification, message) = slot
                    .error
                    .as_ref()
                    .map(|e| (e.class, e.message.clone()))
                    .unwrap_or((FailureClass::Permanent, "shard failed".to_string()));
                failure = Some(RunFailure::PermanentExecution {
                    shard_id: slot.shard_id,
                    attempts: slot.attempt_count,
                    classification,
                    message,
                });
                self.governor.abort();
            }
        }
        while let Some(joined) = drivers.join_next().await {
            joined.map_err(|e| ExecError::Invalid(format!("shard driver failed: {e}")))?;
        }

        let failure = failure.or_else(|| self.governor.tripped().map(RunFailure::from));
        if failure.is_none() {
            if let Some(slot) = arena.slots.iter().find(|s| s.state != ShardState::Succeeded) {
                return Err(ExecError::Invalid(format!(
                    "{} ended in {:?} without a run failure",
                    slot.shard_id, slot.state
                )));
            }
        }
        Ok(MapPhaseOutcome {
            records: arena.slots,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::WeightMeter;
    use async_trait::async_trait;
    use mrp_core::hash::hash_str;
    use mrp_core::id::ShardId;
    use mrp_core::record::BudgetResource;
    use mrp_core::spec::ExecutionBackend;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    type Outcome = fn(&AttemptContext) -> Result<Value, AttemptError>;

    struct Stub {
        calls: AtomicU32,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: fn(u64, u32) -> Duration,
        outcome: Outcome,
    }

    impl Stub {
        fn new(delay: fn(u64, u32) -> Duration, outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
                outcome,
            })
        }
    }

    #[async_trait]
    impl ShardExecutor for Stub {
        fn backend(&self) -> ExecutionBackend {
            ExecutionBackend::Local
        }

        async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep((self.delay)(ctx.task.shard_id.get(), ctx.attempt)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            (self.outcome)(&ctx).map(|v| AttemptOutput::new(v, "stub"))
        }
    }

    fn echo(ctx: &AttemptContext) -> Result<Value, AttemptError> {
        Ok(json!({"shard": ctx.task.shard_id.get()}))
    }

    fn no_delay(_: u64, _: u32) -> Duration {
        Duration::ZERO
    }

    fn tasks(n: u64) -> Vec<MapTask> {
        (0..n)
            .map(|i| MapTask {
                shard_id: ShardId::new(i),
                operator: "stub@1".into(),
                params: json!({"_shard_id": i}),
                task_key: hash_str(&format!("task-{i}")),
            })
            .collect()
    }

    fn cfg(workers: usize, max_retries: u32) -> MapPhaseConfig {
        MapPhaseConfig {
            workers,
            shard_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::immediate(max_retries),
            cache: false,
        }
    }

    fn scheduler(
        exec: Arc<dyn ShardExecutor>,
        store: ArtifactStore,
        governor: Arc<Governor>,
        cfg: MapPhaseConfig,
    ) -> MapScheduler {
        MapScheduler::new(exec, store, governor, Arc::new(WeightMeter { weight: 1.0 }), cfg)
    }

    fn seed() -> Seed {
        Seed(hash_str("seed"))
    }

    #[tokio::test]
    async fn records_stay_in_shard_order_whatever_finishes_first() {
        // shard 0 finishes last
        let stub = Stub::new(|id, _| Duration::from_millis(40 - id * 10), echo);
        let sched = scheduler(stub, ArtifactStore::in_memory(), Arc::new(Governor::new(100.0, None)), cfg(4, 0));
        let out = sched.run(&tasks(4), seed()).await.unwrap();
        assert!(out.failure.is_none());
        let ids: Vec<u64> = out.records.iter().map(|r| r.shard_id.get()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        for r in &out.records {
            assert_eq!(r.state, ShardState::Succeeded);
            assert_eq!(r.attempt_count, 1);
            assert_eq!(r.worker.as_deref(), Some("stub"));
            assert!(r.start_ts <= r.end_ts);
        }
    }

    #[tokio::test]
    async fn always_retryable_shard_gets_exactly_max_retries() {
        let stub = Stub::new(no_delay, |_| Err(AttemptError::retryable("network reset")));
        let sched = scheduler(stub.clone(), ArtifactStore::in_memory(), Arc::new(Governor::new(100.0, None)), cfg(1, 3));
        let out = sched.run(&tasks(1), seed()).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 4);
        assert_eq!(out.records[0].state, ShardState::PermanentlyFailed);
        assert_eq!(out.records[0].attempt_count, 4);
        match out.failure {
            Some(RunFailure::PermanentExecution { attempts, classification, .. }) => {
                assert_eq!(attempts, 4);
                assert_eq!(classification, FailureClass::Retryable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried_and_cancels_the_rest() {
        let stub = Stub::new(
            |id, _| Duration::from_millis(if id == 0 { 0 } else { 200 }),
            |ctx| {
                if ctx.task.shard_id.get() == 0 {
                    Err(AttemptError::permanent("malformed payload"))
                } else {
                    echo(ctx)
                }
            },
        );
        let sched = scheduler(stub, ArtifactStore::in_memory(), Arc::new(Governor::new(100.0, None)), cfg(4, 3));
        let out = sched.run(&tasks(3), seed()).await.unwrap();
        assert_eq!(out.records[0].state, ShardState::PermanentlyFailed);
        assert_eq!(out.records[0].attempt_count, 1);
        assert_eq!(out.records[1].state, ShardState::Cancelled);
        assert!(matches!(
            out.failure,
            Some(RunFailure::PermanentExecution { shard_id, attempts: 1, .. }) if shard_id == ShardId::new(0)
        ));
    }

    #[tokio::test]
    async fn timeout_is_retried() {
        let stub = Stub::new(
            |_, attempt| Duration::from_millis(if attempt == 1 { 500 } else { 0 }),
            echo,
        );
        let mut c = cfg(1, 2);
        c.shard_timeout = Duration::from_millis(30);
        let sched = scheduler(stub, ArtifactStore::in_memory(), Arc::new(Governor::new(100.0, None)), c);
        let out = sched.run(&tasks(1), seed()).await.unwrap();
        assert!(out.failure.is_none());
        assert_eq!(out.records[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn worker_cap_bounds_concurrency() {
        let stub = Stub::new(|_, _| Duration::from_millis(20), echo);
        let gov = Arc::new(Governor::new(100.0, None));
        let sched = scheduler(stub.clone(), ArtifactStore::in_memory(), gov.clone(), cfg(2, 0));
        sched.run(&tasks(6), seed()).await.unwrap();
        assert!(stub.peak.load(Ordering::SeqCst) <= 2);
        assert!(gov.snapshot().peak_concurrency <= 2);
    }

    struct Expensive;

    impl CostMeter for Expensive {
        fn estimate(&self, _shard: ShardId) -> f64 {
            1.0
        }
        fn observe(&self, _shard: ShardId, _attempt: u32, _elapsed: Duration) -> f64 {
            5.0
        }
    }

    #[tokio::test]
    async fn budget_breach_halts_dispatch() {
        let stub = Stub::new(no_delay, echo);
        // cap 10 x 1.2
        let gov = Arc::new(Governor::new(12.0, None));
        let sched = MapScheduler::new(stub.clone(), ArtifactStore::in_memory(), gov, Arc::new(Expensive), cfg(1, 0));
        let out = sched.run(&tasks(8), seed()).await.unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 3);
        match out.failure {
            Some(RunFailure::BudgetExceeded { resource, observed, limit }) => {
                assert_eq!(resource, BudgetResource::Cost);
                assert_eq!(observed, 15.0);
                assert_eq!(limit, 12.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        let cancelled = out.records.iter().filter(|r| r.state == ShardState::Cancelled).count();
        assert_eq!(cancelled, 5);
    }

    #[tokio::test]
    async fn cached_shards_skip_execution() {
        let store = ArtifactStore::in_memory();
        let mut c = cfg(2, 0);
        c.cache = true;

        let first = Stub::new(no_delay, echo);
        scheduler(first.clone(), store.clone(), Arc::new(Governor::new(100.0, None)), c.clone())
            .run(&tasks(3), seed())
            .await
            .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 3);

        let second = Stub::new(no_delay, echo);
        let out = scheduler(second.clone(), store, Arc::new(Governor::new(100.0, None)), c)
            .run(&tasks(3), seed())
            .await
            .unwrap();
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert!(out.records.iter().all(|r| r.cached && r.attempt_count == 0));
    }

    #[test]
    fn arena_rejects_illegal_transitions() {
        let mut arena = ShardArena::new(&tasks(1));
        assert!(arena.apply(0, ShardEvent::Running).is_err());
        arena.apply(0, ShardEvent::Dispatched { attempt: 1, at: 1 }).unwrap();
        arena.apply(0, ShardEvent::Running).unwrap();
        assert!(arena.apply(0, ShardEvent::Retrying).is_err());
        assert!(arena.apply(7, ShardEvent::Running).is_err());
    }
}
