use mrp_core::id::ShardId;
use mrp_core::policy::PolicyCheck;
use mrp_core::record::{BudgetResource, FailureClass, RunFailure};
use mrp_planner::CompileError;
use mrp_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("policy violation at dispatch ({check}): {reason}")]
    PolicyViolation { check: PolicyCheck, reason: String },

    #[error("shard {shard_id} failed permanently after {attempts} attempt(s) ({classification:?}): {message}")]
    PermanentExecution {
        shard_id: ShardId,
        attempts: u32,
        classification: FailureClass,
        message: String,
    },

    #[error("budget exceeded: observed {resource:?} {observed} over limit {limit}")]
    BudgetExceeded {
        resource: BudgetResource,
        observed: f64,
        limit: f64,
    },

    #[error("replay mismatch in {}", fields.join(", "))]
    ReplayMismatch { fields: Vec<String> },

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("reduce failed: {0}")]
    Reduce(String),

    #[error("produce failed: {0}")]
    Produce(String),

    #[error("operator registry: {0}")]
    Registry(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("artifact store: {0}")]
    Store(#[from] StoreError),

    #[error("core: {0}")]
    Core(#[from] mrp_core::Error),

    #[error("invalid runtime state: {0}")]
    Invalid(String),
}

impl From<RunFailure> for ExecError {
    fn from(failure: RunFailure) -> Self {
        match failure {
            RunFailure::PolicyViolation { check, reason } => {
                ExecError::PolicyViolation { check, reason }
            }
            RunFailure::PermanentExecution {
                shard_id,
                attempts,
                classification,
                message,
            } => ExecError::PermanentExecution {
                shard_id,
                attempts,
                classification,
                message,
            },
            RunFailure::BudgetExceeded {
                resource,
                observed,
                limit,
            } => ExecError::BudgetExceeded {
                resource,
                observed,
                limit,
            },
            RunFailure::DispatchFailed { message } => ExecError::Dispatch(message),
            RunFailure::ReduceFailed { message } => ExecError::Reduce(message),
            RunFailure::ProduceFailed { message } => ExecError::Produce(message),
        }
    }
}
