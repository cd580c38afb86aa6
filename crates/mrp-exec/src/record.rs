//! Run record assembly.
//!
//! The assembler collects shard records and phase results while a run is in
//! flight; `seal` consumes it, so a record is sealed exactly once. Sealed
//! records are stored by digest and indexed under `runs/<run_id>` and
//! `jobs/<job_id>` (latest run of a job).

use mrp_core::hash::Digest;
use mrp_core::id::RunId;
use mrp_core::ir::Seed;
use mrp_core::record::{
    CostSummary, PolicyEnforcement, RunFailure, RunRecord, RunStatus, ShardRecord,
};
use mrp_core::spec::ExecutionBackend;
use mrp_store::ArtifactStore;
use serde_json::Value;

use crate::error::ExecError;
use crate::metrics::now_ms;

pub const RUNS_NS: &str = "runs";
pub const JOBS_NS: &str = "jobs";

#[derive(Debug, Clone)]
pub struct RunHeader {
    pub run_id: RunId,
    pub job_id: String,
    pub backend: ExecutionBackend,
    pub ir_digest: Digest,
    pub manifest_digest: Digest,
    pub seed: Seed,
    pub started_ms: u64,
}

#[derive(Debug)]
pub struct RecordAssembler {
    header: RunHeader,
    maps: Vec<ShardRecord>,
    order_digest: Option<Digest>,
    reduce: Option<(Value, Digest)>,
    produce: Option<(Value, Digest)>,
    output_dir: Option<String>,
    policy: PolicyEnforcement,
    costs: CostSummary,
}

impl RecordAssembler {
    pub fn new(header: RunHeader, policy: PolicyEnforcement) -> Self {
        Self {
            header,
            maps: Vec::new(),
            order_digest: None,
            reduce: None,
            produce: None,
            output_dir: None,
            policy,
            costs: CostSummary::default(),
        }
    }

    pub fn header(&self) -> &RunHeader {
        &self.header
    }

    pub fn set_maps(&mut self, maps: Vec<ShardRecord>) {
        self.maps = maps;
    }

    pub fn maps(&self) -> &[ShardRecord] {
        &self.maps
    }

    pub fn set_order_digest(&mut self, digest: Digest) {
        self.order_digest = Some(digest);
    }

    pub fn set_reduce(&mut self, result: Value, digest: Digest) {
        self.reduce = Some((result, digest));
    }

    pub fn reduce_result(&self) -> Option<&Value> {
        self.reduce.as_ref().map(|(v, _)| v)
    }

    pub fn set_produce(&mut self, result: Value, digest: Digest) {
        self.produce = Some((result, digest));
    }

    pub fn set_output_dir(&mut self, dir: impl Into<String>) {
        self.output_dir = Some(dir.into());
    }

    pub fn costs_mut(&mut self) -> &mut CostSummary {
        &mut self.costs
    }

    pub fn seal(self, failure: Option<RunFailure>) -> RunRecord {
        let mut policy = self.policy;
        policy.killed = matches!(failure, Some(RunFailure::BudgetExceeded { .. }));
        let (reduce_result, reduce_result_digest) = split(self.reduce);
        let (produce_result, produce_result_digest) = split(self.produce);
        RunRecord {
            run_id: self.header.run_id,
            job_id: self.header.job_id,
            backend: self.header.backend,
            ir_digest: self.header.ir_digest,
            manifest_digest: self.header.manifest_digest,
            seed: self.header.seed,
            status: if failure.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Succeeded
            },
            failure,
            maps: self.maps,
            reduce_result,
            produce_result,
            reduce_result_digest,
            produce_result_digest,
            reduce_input_order_digest: self.order_digest,
            policy_enforcement: policy,
            costs: self.costs,
            output_dir: self.output_dir,
            engine_version: mrp_core::VERSION.to_string(),
            started_ms: self.header.started_ms,
            finished_ms: now_ms(),
        }
    }
}

fn split(pair: Option<(Value, Digest)>) -> (Option<Value>, Option<Digest>) {
    match pair {
        Some((v, d)) => (Some(v), Some(d)),
        None => (None, None),
    }
}

/// Store a sealed record and index it. Returns the run digest.
pub fn store_record(store: &ArtifactStore, record: &RunRecord) -> Result<Digest, ExecError> {
    let digest = store.put_json(record)?;
    store.set_ref(RUNS_NS, &record.run_id.to_string(), &digest)?;
    store.set_ref(JOBS_NS, &record.job_id, &digest)?;
    Ok(digest)
}

pub fn load_record(store: &ArtifactStore, digest: &Digest) -> Result<RunRecord, ExecError> {
    Ok(store.get_verified(digest)?.json()?)
}
