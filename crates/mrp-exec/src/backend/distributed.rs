//! Cluster backend.
//!
//! Tasks are handed to a `ClusterScheduler`, which places them on some
//! worker and reports that worker's identity with the output. The loopback
//! scheduler round-robins over named in-process workers; real clusters plug
//! in behind the same trait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mrp_core::ir::{MapTask, Seed};
use mrp_core::spec::ExecutionBackend;
use mrp_operators::MapOperator;
use serde_json::Value;
use tracing::debug;

use super::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub worker_id: String,
    pub output: Value,
}

#[async_trait]
pub trait ClusterScheduler: Send + Sync + 'static {
    /// Run one task somewhere on the cluster.
    async fn submit(&self, task: &MapTask, seed: &Seed) -> Result<ClusterAssignment, AttemptError>;
}

pub struct LoopbackCluster {
    workers: Vec<String>,
    next: AtomicUsize,
    operator: Arc<dyn MapOperator>,
}

impl LoopbackCluster {
    pub fn new(operator: Arc<dyn MapOperator>, workers: usize) -> Self {
        Self {
            workers: (0..workers.max(1)).map(|i| format!("loopback-{i}")).collect(),
            next: AtomicUsize::new(0),
            operator,
        }
    }

    pub fn workers(&self) -> &[String] {
        &self.workers
    }
}

#[async_trait]
impl ClusterScheduler for LoopbackCluster {
    async fn submit(&self, task: &MapTask, seed: &Seed) -> Result<ClusterAssignment, AttemptError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker_id = self.workers[slot].clone();
        debug!(shard = %task.shard_id, worker = %worker_id, "loopback placement");

        let op = self.operator.clone();
        let params = task.params.clone();
        let seed = *seed;
        let output = tokio::task::spawn_blocking(move || op.run(&params, &seed))
            .await
            .map_err(|e| AttemptError::permanent(format!("worker task failed: {e}")))?
            .map_err(|e| AttemptError::from(e).on_worker(worker_id.clone()))?;

        Ok(ClusterAssignment { worker_id, output })
    }
}

pub struct DistributedExecutor {
    cluster: Arc<dyn ClusterScheduler>,
}

impl DistributedExecutor {
    pub fn new(cluster: Arc<dyn ClusterScheduler>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ShardExecutor for DistributedExecutor {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::Distributed
    }

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
        let assignment = self.cluster.submit(&ctx.task, &ctx.seed).await?;
        Ok(AttemptOutput::new(assignment.output, assignment.worker_id))
    }
}
