//! Shared fixtures for the workspace integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mrp::core::spec::ExecutionBackend;
use mrp::exec::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};
use mrp::operators::builtin::Uppercase;
use mrp::operators::MapOperator;
use mrp::{Engine, EngineConfig, OperatorRegistry};
use tempfile::TempDir;

pub const TOY: &str = r#"
job_id: toy
map:
  operator: uppercase
  shards:
    - { id: 0, text: foo }
    - { id: 1, text: bar }
reduce: { operator: concat, config: { separator: "-" } }
produce: { operator: json_writer }
"#;

pub fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        store_dir: dir.path().join("store").display().to_string(),
        outputs_dir: dir.path().join("outputs").display().to_string(),
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 5,
        ..EngineConfig::default()
    }
}

pub fn engine(cfg: EngineConfig) -> Engine {
    Engine::new(cfg, Arc::new(OperatorRegistry::with_builtins().unwrap())).unwrap()
}

/// Runs `uppercase` after a per-shard delay, so tests choose completion order.
pub struct Delayed {
    pub delays_ms: Vec<u64>,
}

#[async_trait]
impl ShardExecutor for Delayed {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::Local
    }

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
        let id = ctx.task.shard_id.get() as usize;
        let delay = self.delays_ms.get(id).copied().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let output = Uppercase.run(&ctx.task.params, &ctx.seed)?;
        Ok(AttemptOutput::new(output, format!("delayed-{id}")))
    }
}

/// Fails every attempt with a retryable error and counts the calls.
#[derive(Default)]
pub struct AlwaysFlaky {
    pub calls: AtomicU32,
}

#[async_trait]
impl ShardExecutor for AlwaysFlaky {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::Local
    }

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AttemptError::retryable(format!(
            "{} unavailable on attempt {}",
            ctx.task.shard_id, ctx.attempt
        )))
    }
}
