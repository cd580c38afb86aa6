//! Engine: one run = policy gate → Map (chosen backend) → merge → Reduce →
//! Produce → sealed record.
//!
//! Reduce and Produce always run here, locally and one after the other, and
//! only once every shard has succeeded. Any terminal failure seals the record
//! with the last known shard states instead of returning early without one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mrp_core::config::EngineConfig;
use mrp_core::hash::Digest;
use mrp_core::id::RunId;
use mrp_core::ir::{Ir, Manifest, OperatorIdentity, OperatorSource};
use mrp_core::policy::{PolicyCheck, PolicyStatus};
use mrp_core::record::{PolicyEnforcement, RunFailure, RunRecord, ShardRecord};
use mrp_core::spec::ExecutionBackend;
use mrp_operators::{
    GeneratedOperator, MapOperator, OperatorPackage, OperatorRegistry, PackageRunner,
    ProduceContext, ProduceOperator, ReduceOperator, UnsupportedRunner,
};
use mrp_planner::{Compiled, Compiler, PolicyEngine, PolicyRequest};
use mrp_store::ArtifactStore;
use tracing::{debug, info, warn};

use crate::backend::{
    ClusterScheduler, DistributedExecutor, LocalExecutor, LoopbackCluster, LoopbackSandbox,
    SandboxExecutor, SandboxProvider, SandboxSpec, ShardExecutor,
};
use crate::error::ExecError;
use crate::governor::{CostMeter, Governor, WeightMeter};
use crate::merge::merge_outputs;
use crate::metrics::{emit_span, now_ms};
use crate::record::{store_record, RecordAssembler, RunHeader};
use crate::retry::BackoffPolicy;
use crate::scheduler::{MapPhaseConfig, MapScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    Normal,
    /// Re-execution of a sealed run: no shard cache, separate output dir.
    Replay,
}

/// A sealed run and the digest it is stored under.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub digest: Digest,
    pub record: RunRecord,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.record.succeeded()
    }

    /// Surface the record's failure class as an error.
    pub fn into_result(self) -> Result<Self, ExecError> {
        match &self.record.failure {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(self),
        }
    }
}

struct Operators {
    map: OperatorIdentity,
    reduce: Arc<dyn ReduceOperator>,
    produce: Arc<dyn ProduceOperator>,
}

pub struct EngineBuilder {
    cfg: EngineConfig,
    registry: Arc<OperatorRegistry>,
    store: Option<ArtifactStore>,
    runner: Option<Arc<dyn PackageRunner>>,
    cluster: Option<Arc<dyn ClusterScheduler>>,
    sandbox: Option<Arc<dyn SandboxProvider>>,
    meter: Option<Arc<dyn CostMeter>>,
    executor: Option<Arc<dyn ShardExecutor>>,
    backoff: Option<BackoffPolicy>,
}

impl EngineBuilder {
    pub fn store(mut self, store: ArtifactStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn package_runner(mut self, runner: Arc<dyn PackageRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterScheduler>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn sandbox_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.sandbox = Some(provider);
        self
    }

    pub fn cost_meter(mut self, meter: Arc<dyn CostMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Route every Map attempt through this executor regardless of backend.
    pub fn executor(mut self, executor: Arc<dyn ShardExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn build(self) -> Result<Engine, ExecError> {
        self.cfg.validate()?;
        let store = match self.store {
            Some(store) => store,
            None => ArtifactStore::open(&self.cfg.store_config())?,
        };
        let runner = self.runner.unwrap_or_else(|| Arc::new(UnsupportedRunner));
        let sandbox = self.sandbox.unwrap_or_else(|| {
            Arc::new(LoopbackSandbox::new(self.registry.clone(), runner.clone()))
        });
        Ok(Engine {
            policy: PolicyEngine::new(&self.cfg),
            backoff: self
                .backoff
                .unwrap_or_else(|| BackoffPolicy::from_config(&self.cfg)),
            cfg: self.cfg,
            registry: self.registry,
            store,
            runner,
            cluster: self.cluster,
            sandbox,
            meter: self.meter,
            executor: self.executor,
        })
    }
}

pub struct Engine {
    cfg: EngineConfig,
    registry: Arc<OperatorRegistry>,
    store: ArtifactStore,
    policy: PolicyEngine,
    backoff: BackoffPolicy,
    runner: Arc<dyn PackageRunner>,
    cluster: Option<Arc<dyn ClusterScheduler>>,
    sandbox: Arc<dyn SandboxProvider>,
    meter: Option<Arc<dyn CostMeter>>,
    executor: Option<Arc<dyn ShardExecutor>>,
}

impl Engine {
    pub fn builder(cfg: EngineConfig, registry: Arc<OperatorRegistry>) -> EngineBuilder {
        EngineBuilder {
            cfg,
            registry,
            store: None,
            runner: None,
            cluster: None,
            sandbox: None,
            meter: None,
            executor: None,
            backoff: None,
        }
    }

    pub fn new(cfg: EngineConfig, registry: Arc<OperatorRegistry>) -> Result<Self, ExecError> {
        Self::builder(cfg, registry).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    /// A compiler bound to this engine's registry and configuration.
    pub fn compiler(&self) -> Compiler {
        Compiler::new(self.registry.clone(), &self.cfg)
    }

    /// Compile YAML/JSON job text and run it.
    pub async fn run_str(&self, src: &str) -> Result<RunOutcome, ExecError> {
        let compiled = self.compiler().compile_str(src)?;
        self.run(&compiled).await
    }

    /// Store the compiled snapshot (IR, manifest, generated packages) and run it.
    pub async fn run(&self, compiled: &Compiled) -> Result<RunOutcome, ExecError> {
        for (digest, package) in &compiled.packages {
            let stored = self.store.put_json(package)?;
            if stored != *digest {
                return Err(ExecError::Invalid(format!(
                    "package `{}` stored as {} but compiled as {}",
                    package.entrypoint,
                    stored.short(),
                    digest.short()
                )));
            }
        }
        self.execute(&compiled.ir, &compiled.manifest, RunMode::Normal)
            .await
    }

    fn generated_package(&self, ident: &OperatorIdentity) -> Result<Option<OperatorPackage>, ExecError> {
        match &ident.source {
            OperatorSource::Registered => Ok(None),
            OperatorSource::Generated { package, .. } => Ok(Some(self.store.get_json(package)?)),
        }
    }

    fn check_registered(&self, ident: &OperatorIdentity) -> Result<(), ExecError> {
        let entry = self.registry.get(&ident.reference).ok_or_else(|| {
            ExecError::Registry(format!("operator `{}` is not registered", ident.reference))
        })?;
        if entry.digest != ident.digest {
            return Err(ExecError::Registry(format!(
                "operator `{}` changed since the job was compiled",
                ident.reference
            )));
        }
        Ok(())
    }

    fn generated(&self, ident: &OperatorIdentity) -> Result<Option<Arc<GeneratedOperator>>, ExecError> {
        Ok(self
            .generated_package(ident)?
            .map(|pkg| Arc::new(GeneratedOperator::new(pkg, ident.digest, self.runner.clone()))))
    }

    fn map_operator(&self, ident: &OperatorIdentity) -> Result<Arc<dyn MapOperator>, ExecError> {
        if let Some(op) = self.generated(ident)? {
            return Ok(op as Arc<dyn MapOperator>);
        }
        self.check_registered(ident)?;
        self.registry
            .map_operator(&ident.reference)
            .ok_or_else(|| ExecError::Registry(format!("`{}` is not a map operator", ident.reference)))
    }

    fn resolve_operators(&self, manifest: &Manifest) -> Result<Operators, ExecError> {
        let ops = &manifest.operators;
        if ops.map.source == OperatorSource::Registered {
            self.check_registered(&ops.map)?;
        }
        let reduce: Arc<dyn ReduceOperator> = match self.generated(&ops.reduce)? {
            Some(op) => op as Arc<dyn ReduceOperator>,
            None => {
                self.check_registered(&ops.reduce)?;
                self.registry.reduce_operator(&ops.reduce.reference).ok_or_else(|| {
                    ExecError::Registry(format!("`{}` is not a reduce operator", ops.reduce.reference))
                })?
            }
        };
        let produce: Arc<dyn ProduceOperator> = match self.generated(&ops.produce)? {
            Some(op) => op as Arc<dyn ProduceOperator>,
            None => {
                self.check_registered(&ops.produce)?;
                self.registry.produce_operator(&ops.produce.reference).ok_or_else(|| {
                    ExecError::Registry(format!("`{}` is not a produce operator", ops.produce.reference))
                })?
            }
        };
        Ok(Operators {
            map: ops.map.clone(),
            reduce,
            produce,
        })
    }

    fn executor_for(&self, ir: &Ir, map: &OperatorIdentity, workers: usize) -> Result<Arc<dyn ShardExecutor>, ExecError> {
        if let Some(executor) = &self.executor {
            return Ok(executor.clone());
        }
        Ok(match ir.backend {
            ExecutionBackend::Local => Arc::new(LocalExecutor::new(self.map_operator(map)?)),
            ExecutionBackend::Distributed => {
                let cluster = match &self.cluster {
                    Some(cluster) => cluster.clone(),
                    None => Arc::new(LoopbackCluster::new(self.map_operator(map)?, workers)),
                };
                Arc::new(DistributedExecutor::new(cluster))
            }
            ExecutionBackend::SandboxedRemote => {
                let (name, profile) = self
                    .cfg
                    .sandbox_profile(ir.sandbox_profile_ref.as_deref())
                    .ok_or_else(|| {
                        ExecError::Invalid(format!(
                            "sandbox profile `{}` is not configured",
                            ir.sandbox_profile_ref.as_deref().unwrap_or("default")
                        ))
                    })?;
                Arc::new(SandboxExecutor::new(
                    self.sandbox.clone(),
                    self.store.clone(),
                    SandboxSpec::from_profile(name, profile),
                    map.clone(),
                    self.generated_package(map)?,
                ))
            }
        })
    }

    fn output_dir(&self, job_id: &str, run_id: &RunId, mode: RunMode) -> PathBuf {
        let base = PathBuf::from(&self.cfg.outputs_dir).join(job_id);
        match mode {
            RunMode::Normal => base.join(run_id.to_string()),
            RunMode::Replay => base.join("replays").join(run_id.to_string()),
        }
    }

    fn finish(
        &self,
        mut assembler: RecordAssembler,
        governor: Option<&Governor>,
        failure: Option<RunFailure>,
    ) -> Result<RunOutcome, ExecError> {
        if let Some(governor) = governor {
            let snap = governor.snapshot();
            let costs = assembler.costs_mut();
            costs.observed = snap.observed;
            costs.attempts = snap.attempts;
            costs.elapsed_ms = snap.elapsed.as_millis() as u64;
            costs.peak_concurrency = snap.peak_concurrency;
        }
        let record = assembler.seal(failure);
        let digest = store_record(&self.store, &record)?;
        match &record.failure {
            None => info!(job_id = %record.job_id, run = %digest.short(), "run sealed: succeeded"),
            Some(failure) => warn!(job_id = %record.job_id, run = %digest.short(), ?failure, "run sealed: failed"),
        }
        emit_span(
            "run.sealed",
            &[
                ("job_id", record.job_id.clone()),
                ("digest", digest.to_hex()),
                ("succeeded", record.succeeded().to_string()),
            ],
        );
        Ok(RunOutcome { digest, record })
    }

    pub(crate) async fn execute(&self, ir: &Ir, manifest: &Manifest, mode: RunMode) -> Result<RunOutcome, ExecError> {
        if ir.seed != manifest.seed || ir.job_id != manifest.job_id {
            return Err(ExecError::Invalid("IR and manifest do not belong together".into()));
        }
        let run_id = RunId::new();
        let header = RunHeader {
            run_id,
            job_id: ir.job_id.clone(),
            backend: ir.backend,
            ir_digest: self.store.put_json(ir)?,
            manifest_digest: self.store.put_json(manifest)?,
            seed: ir.seed,
            started_ms: now_ms(),
        };
        info!(job_id = %ir.job_id, %run_id, backend = %ir.backend, ?mode, shards = ir.maps.len(), "run starting");

        // Dispatch-time policy gate, against this engine's configuration.
        let report = self.policy.evaluate(&PolicyRequest::from_ir(ir, manifest));
        let mut assembler = RecordAssembler::new(
            header,
            PolicyEnforcement {
                compile_status: PolicyStatus::Ok,
                dispatch_status: report.status,
                egress_allowlist: report.egress_allowlist.clone(),
                caps: report.caps.clone(),
                kill_threshold: report.cost_estimate.kill_threshold,
                killed: false,
            },
        );
        assembler.set_maps(ir.maps.iter().map(|t| ShardRecord::pending(t.shard_id)).collect());
        {
            let costs = assembler.costs_mut();
            costs.estimate = report.cost_estimate.total;
            costs.limit = report.cost_estimate.kill_limit();
        }
        if !report.is_ok() {
            let (check, reason) = report
                .failing_check()
                .map(|c| (c.check, c.reason.clone().unwrap_or_default()))
                .unwrap_or((PolicyCheck::Caps, "policy rejected".to_string()));
            warn!(%check, %reason, "dispatch refused by policy");
            return self.finish(assembler, None, Some(RunFailure::PolicyViolation { check, reason }));
        }

        let resolved = self
            .resolve_operators(manifest)
            .and_then(|ops| Ok((self.executor_for(ir, &ops.map, report.caps.workers)?, ops)));
        let (executor, operators) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "dispatch refused: operators or backend unresolved");
                let failure = RunFailure::DispatchFailed { message: e.to_string() };
                return self.finish(assembler, None, Some(failure));
            }
        };
        let governor = Arc::new(Governor::new(
            report.cost_estimate.kill_limit(),
            Some(Duration::from_secs(report.caps.time_s)),
        ));
        let meter = self.meter.clone().unwrap_or_else(|| {
            Arc::new(WeightMeter {
                weight: report.cost_estimate.map_weight,
            })
        });
        let scheduler = MapScheduler::new(
            executor,
            self.store.clone(),
            governor.clone(),
            meter,
            MapPhaseConfig {
                workers: report.caps.workers,
                shard_timeout: Duration::from_millis(self.cfg.shard_timeout_ms),
                backoff: self.backoff.clone(),
                cache: self.cfg.shard_cache && ir.map_cache && mode == RunMode::Normal,
            },
        );

        let map = scheduler.run(&ir.maps, ir.seed).await?;
        assembler.set_maps(map.records);
        if let Some(failure) = map.failure {
            return self.finish(assembler, Some(governor.as_ref()), Some(failure));
        }

        // A corrupt shard output is a terminal failure of this run, not an
        // engine error; the record still gets sealed.
        let merged = match merge_outputs(&self.store, assembler.maps()) {
            Ok(merged) => merged,
            Err(e) => {
                let failure = RunFailure::ReduceFailed {
                    message: format!("merging shard outputs: {e}"),
                };
                return self.finish(assembler, Some(governor.as_ref()), Some(failure));
            }
        };
        assembler.set_order_digest(merged.order_digest);
        info!(order = %merged.order_digest.short(), inputs = merged.values.len(), "map merged; reducing");

        let reduced = {
            let op = operators.reduce.clone();
            let config = ir.reduce.config.clone();
            let seed = ir.seed;
            let inputs = merged.values;
            tokio::task::spawn_blocking(move || op.run(&inputs, &config, &seed))
                .await
                .map_err(|e| ExecError::Invalid(format!("reduce task: {e}")))?
        };
        let reduced = match reduced {
            Ok(value) => value,
            Err(e) => {
                let failure = RunFailure::ReduceFailed { message: e.to_string() };
                return self.finish(assembler, Some(governor.as_ref()), Some(failure));
            }
        };
        let reduce_digest = self.store.put_json(&reduced)?;
        assembler.set_reduce(reduced.clone(), reduce_digest);
        emit_span("reduce.done", &[("digest", reduce_digest.to_hex())]);

        // Reduce and Produce are charged before the side effect, so a breach
        // stops the run before anything leaves the store.
        let post_map = report.cost_estimate.reduce_weight + report.cost_estimate.produce_weight;
        if let Some(trip) = governor.charge(post_map) {
            return self.finish(assembler, Some(governor.as_ref()), Some(trip.into()));
        }

        let output_dir = self.output_dir(&ir.job_id, &run_id, mode);
        let sink = operators.produce.sink(&ir.produce.config);
        debug!(dir = %output_dir.display(), destination = %sink.destination, schema = %sink.schema_ref, "producing");
        if let Err(e) = std::fs::create_dir_all(&output_dir) {
            let failure = RunFailure::ProduceFailed {
                message: format!("creating {}: {e}", output_dir.display()),
            };
            return self.finish(assembler, Some(governor.as_ref()), Some(failure));
        }
        assembler.set_output_dir(output_dir.display().to_string());

        let produced = {
            let op = operators.produce.clone();
            let config = ir.produce.config.clone();
            let seed = ir.seed;
            let ctx = ProduceContext {
                output_dir,
                replay: mode == RunMode::Replay,
            };
            tokio::task::spawn_blocking(move || op.run(&reduced, &config, &ctx, &seed))
                .await
                .map_err(|e| ExecError::Invalid(format!("produce task: {e}")))?
        };
        match produced {
            Ok(value) => {
                let digest = self.store.put_json(&value)?;
                assembler.set_produce(value, digest);
                self.finish(assembler, Some(governor.as_ref()), None)
            }
            Err(e) => {
                let failure = RunFailure::ProduceFailed { message: e.to_string() };
                self.finish(assembler, Some(governor.as_ref()), Some(failure))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_core::config::SandboxProfile;
    use mrp_core::id::ShardId;
    use crate::backend::LAUNCHER_PANIC_EXIT;
    use mrp_core::record::{BudgetResource, FailureClass, ShardState};
    use serde_json::json;
    use tempfile::TempDir;

    const TOY: &str = r#"
job_id: toy
map:
  operator: uppercase
  shards:
    - { id: 0, text: foo }
    - { id: 1, text: bar }
reduce: { operator: concat, config: { separator: "-" } }
produce: { operator: json_writer }
"#;

    fn registry() -> Arc<OperatorRegistry> {
        Arc::new(OperatorRegistry::with_builtins().unwrap())
    }

    fn engine_with(dir: &TempDir, tweak: impl FnOnce(&mut EngineConfig)) -> Engine {
        engine_on(dir, registry(), tweak)
    }

    fn engine_on(dir: &TempDir, registry: Arc<OperatorRegistry>, tweak: impl FnOnce(&mut EngineConfig)) -> Engine {
        let mut cfg = EngineConfig {
            outputs_dir: dir.path().display().to_string(),
            ..EngineConfig::default()
        };
        cfg.sandbox_profiles.insert(
            "default".into(),
            SandboxProfile {
                endpoint: "https://sandbox.example".into(),
                image: None,
                workers: Some(2),
                time_s: None,
                mem_mb: None,
            },
        );
        tweak(&mut cfg);
        Engine::builder(cfg, registry)
            .store(ArtifactStore::in_memory())
            .backoff(BackoffPolicy::immediate(3))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn toy_job_runs_end_to_end() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, |_| {});
        let outcome = engine.run_str(TOY).await.unwrap();

        assert!(outcome.succeeded(), "{:?}", outcome.record.failure);
        let record = &outcome.record;
        assert_eq!(record.reduce_result, Some(json!({"joined": "FOO-BAR"})));
        assert!(record.maps.iter().all(|m| m.state == ShardState::Succeeded));
        assert!(record.reduce_input_order_digest.is_some());

        let out = PathBuf::from(record.output_dir.as_ref().unwrap()).join("result.json");
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(out).unwrap()).unwrap();
        assert_eq!(written, json!({"joined": "FOO-BAR"}));

        let indexed = engine
            .store()
            .get_ref(crate::record::RUNS_NS, &record.run_id.to_string())
            .unwrap();
        assert_eq!(indexed, Some(outcome.digest));
    }

    #[tokio::test]
    async fn backends_produce_the_same_result() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, |cfg| cfg.shard_cache = false);
        let local = engine.run_str(TOY).await.unwrap().record;

        let mut digests = Vec::new();
        for backend in ["distributed", "sandboxed_remote"] {
            let src = TOY.replace("job_id: toy", &format!("job_id: toy\nexecution_backend: {backend}"));
            let record = engine.run_str(&src).await.unwrap().record;
            assert!(record.succeeded(), "{backend}: {:?}", record.failure);
            digests.push((record.reduce_result_digest, record.reduce_input_order_digest));
        }
        for pair in digests {
            assert_eq!(pair, (local.reduce_result_digest, local.reduce_input_order_digest));
        }
    }

    #[tokio::test]
    async fn dispatch_rechecks_policy() {
        let dir = TempDir::new().unwrap();
        // compiled under a generous budget, dispatched under a tight one
        let compiled = Compiler::new(registry(), &EngineConfig::default())
            .compile_str(TOY)
            .unwrap();
        let engine = engine_with(&dir, |cfg| cfg.budget_cap = 1.0);

        let outcome = engine.run(&compiled).await.unwrap();
        let record = &outcome.record;
        assert!(matches!(
            record.failure,
            Some(RunFailure::PolicyViolation { check: PolicyCheck::Cost, .. })
        ));
        assert_eq!(record.policy_enforcement.dispatch_status, PolicyStatus::Rejected);
        assert!(record.maps.iter().all(|m| m.state == ShardState::Pending));
        assert!(record.output_dir.is_none());
        assert!(matches!(
            outcome.into_result(),
            Err(ExecError::PolicyViolation { .. })
        ));
    }

    #[tokio::test]
    async fn reduce_failure_skips_produce() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, |_| {});
        let src = TOY.replace("separator: \"-\"", "field: missing");
        let record = engine.run_str(&src).await.unwrap().record;

        assert!(matches!(record.failure, Some(RunFailure::ReduceFailed { .. })));
        assert!(record.maps.iter().all(|m| m.state == ShardState::Succeeded));
        assert!(record.produce_result.is_none());
        assert!(record.output_dir.is_none());
    }

    struct Overrun;

    impl CostMeter for Overrun {
        fn estimate(&self, _shard: ShardId) -> f64 {
            1.0
        }

        fn observe(&self, _shard: ShardId, _attempt: u32, _elapsed: Duration) -> f64 {
            1.5
        }
    }

    #[tokio::test]
    async fn budget_trip_after_reduce_blocks_produce() {
        let dir = TempDir::new().unwrap();
        // estimate 2 + 1 + 1 = 4 fits the cap; limit 4.8; map observes 3.0,
        // the post-map charge of 2.0 breaches.
        let cfg = EngineConfig {
            outputs_dir: dir.path().display().to_string(),
            budget_cap: 4.0,
            kill_threshold: 1.2,
            ..EngineConfig::default()
        };
        let engine = Engine::builder(cfg, registry())
            .store(ArtifactStore::in_memory())
            .cost_meter(Arc::new(Overrun))
            .build()
            .unwrap();

        let record = engine.run_str(TOY).await.unwrap().record;
        match record.failure {
            Some(RunFailure::BudgetExceeded { resource, observed, limit }) => {
                assert_eq!(resource, BudgetResource::Cost);
                assert!((observed - 5.0).abs() < 1e-9);
                assert!((limit - 4.8).abs() < 1e-9);
            }
            ref other => panic!("unexpected {other:?}"),
        }
        assert!(record.policy_enforcement.killed);
        assert!(record.reduce_result.is_some());
        assert!(record.produce_result.is_none());
        assert!(record.output_dir.is_none());
    }

    struct Explode;

    impl MapOperator for Explode {
        fn name(&self) -> &str {
            "explode"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn run(&self, _params: &serde_json::Value, _seed: &mrp_core::ir::Seed) -> Result<serde_json::Value, mrp_operators::OpError> {
            panic!("explode always panics")
        }
    }

    #[tokio::test]
    async fn sandbox_panic_fails_the_shard_without_retrying() {
        use mrp_operators::builtin::{Concat, JsonWriter};

        let dir = TempDir::new().unwrap();
        let registry = OperatorRegistry::builder()
            .map(Explode)
            .reduce(Concat)
            .produce(JsonWriter)
            .build()
            .unwrap();
        let engine = engine_on(&dir, Arc::new(registry), |cfg| cfg.shard_cache = false);
        let src = TOY
            .replace("operator: uppercase", "operator: explode")
            .replace("    - { id: 1, text: bar }\n", "")
            .replace("job_id: toy", "job_id: toy\nexecution_backend: sandboxed_remote");

        let record = engine.run_str(&src).await.unwrap().record;
        match &record.failure {
            Some(RunFailure::PermanentExecution { attempts, classification, .. }) => {
                assert_eq!(*attempts, 1);
                assert_eq!(*classification, FailureClass::Permanent);
            }
            other => panic!("unexpected {other:?}"),
        }
        let shard = &record.maps[0];
        assert_eq!(shard.state, ShardState::PermanentlyFailed);
        assert_eq!(shard.attempt_count, 1);
        assert_eq!(shard.exit_code, Some(LAUNCHER_PANIC_EXIT));
        assert!(record.produce_result.is_none());
    }

    #[tokio::test]
    async fn registry_drift_seals_a_record_without_dispatching() {
        use mrp_operators::builtin::{Average, JsonWriter, Uppercase};

        let dir = TempDir::new().unwrap();
        let compiled = Compiler::new(registry(), &EngineConfig::default())
            .compile_str(TOY)
            .unwrap();
        // this engine no longer ships `concat`
        let drifted = OperatorRegistry::builder()
            .map(Uppercase)
            .reduce(Average)
            .produce(JsonWriter)
            .build()
            .unwrap();
        let cfg = EngineConfig {
            outputs_dir: dir.path().display().to_string(),
            ..EngineConfig::default()
        };
        let engine = Engine::builder(cfg, Arc::new(drifted))
            .store(ArtifactStore::in_memory())
            .build()
            .unwrap();

        let outcome = engine.run(&compiled).await.unwrap();
        let record = &outcome.record;
        match &record.failure {
            Some(RunFailure::DispatchFailed { message }) => assert!(message.contains("concat"), "{message}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(record.maps.iter().all(|m| m.state == ShardState::Pending));
        assert_eq!(record.costs.attempts, 0);
        assert!(record.output_dir.is_none());
        let indexed = engine
            .store()
            .get_ref(crate::record::RUNS_NS, &record.run_id.to_string())
            .unwrap();
        assert_eq!(indexed, Some(outcome.digest));
        assert!(matches!(outcome.into_result(), Err(ExecError::Dispatch(_))));
    }

    #[tokio::test]
    async fn unknown_sandbox_profile_never_dispatches() {
        let dir = TempDir::new().unwrap();
        let engine = engine_with(&dir, |_| {});
        let src = TOY.replace(
            "job_id: toy",
            "job_id: toy\nexecution_backend: sandboxed_remote\nsandbox_profile_ref: gpu",
        );
        assert!(matches!(
            engine.run_str(&src).await.unwrap_err(),
            ExecError::Compile(_)
        ));
    }
}
