//! Map-phase backends behind one contract.
//!
//! A `ShardExecutor` runs exactly one attempt of one Map task and reports the
//! output plus who ran it. Retries, timeouts, cancellation, ordering and
//! persistence all live in the scheduler, so backends stay small.

use async_trait::async_trait;
use mrp_core::ir::{MapTask, Seed};
use mrp_core::record::FailureClass;
use mrp_core::spec::ExecutionBackend;
use mrp_operators::OpError;
use serde_json::Value;
use thiserror::Error;

pub mod distributed;
pub mod local;
pub mod sandbox;

pub use distributed::{ClusterAssignment, ClusterScheduler, DistributedExecutor, LoopbackCluster};
pub use local::LocalExecutor;
pub use sandbox::{
    LaunchResult, LoopbackSandbox, LAUNCHER_PANIC_EXIT, ProviderError, SandboxExecutor, SandboxHandle, SandboxProvider,
    SandboxSpec, ShardPackage,
};

/// One attempt's input. Each attempt owns its copy of the task params.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub task: MapTask,
    pub seed: Seed,
    /// 1-based.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutput {
    pub output: Value,
    /// Worker, node or sandbox identity.
    pub worker: String,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub package_digest: Option<mrp_core::hash::Digest>,
}

impl AttemptOutput {
    pub fn new(output: Value, worker: impl Into<String>) -> Self {
        Self {
            output,
            worker: worker.into(),
            exit_code: Some(0),
            stdout: None,
            package_digest: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    #[error("retryable: {message}")]
    Retryable {
        message: String,
        worker: Option<String>,
    },

    #[error("permanent: {message}")]
    Permanent {
        message: String,
        worker: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl AttemptError {
    pub fn retryable(message: impl Into<String>) -> Self {
        AttemptError::Retryable {
            message: message.into(),
            worker: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        AttemptError::Permanent {
            message: message.into(),
            worker: None,
            exit_code: None,
        }
    }

    /// Attach the worker that produced the failure, if not already set.
    pub fn on_worker(mut self, who: impl Into<String>) -> Self {
        match &mut self {
            AttemptError::Retryable { worker, .. } | AttemptError::Permanent { worker, .. } => {
                worker.get_or_insert_with(|| who.into());
            }
            AttemptError::Cancelled => {}
        }
        self
    }

    pub fn class(&self) -> FailureClass {
        match self {
            AttemptError::Retryable { .. } => FailureClass::Retryable,
            AttemptError::Permanent { .. } | AttemptError::Cancelled => FailureClass::Permanent,
        }
    }

    pub fn worker(&self) -> Option<&str> {
        match self {
            AttemptError::Retryable { worker, .. } | AttemptError::Permanent { worker, .. } => {
                worker.as_deref()
            }
            AttemptError::Cancelled => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            AttemptError::Permanent { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

impl From<OpError> for AttemptError {
    fn from(e: OpError) -> Self {
        if e.is_retryable() {
            AttemptError::retryable(e.to_string())
        } else {
            AttemptError::permanent(e.to_string())
        }
    }
}

#[async_trait]
pub trait ShardExecutor: Send + Sync + 'static {
    fn backend(&self) -> ExecutionBackend;

    async fn execute(&self, ctx: AttemptContext) -> Result<AttemptOutput, AttemptError>;
}
