//! Shard and run records for audit/replay.
//!
//! The exec crate fills these while a run is in flight and seals the
//! `RunRecord` exactly once; the sealed record is stored by digest and replay
//! compares its result digests against a fresh execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::Digest;
use crate::id::{RunId, ShardId};
use crate::ir::Seed;
use crate::policy::{Caps, PolicyCheck, PolicyStatus};
use crate::spec::ExecutionBackend;

/// Per-shard lifecycle.
///
/// `Pending → Dispatched → Running → {Succeeded | Failed}`;
/// `Failed → Retrying → Dispatched` or `Failed → PermanentlyFailed`.
/// Any non-terminal state may move to `Cancelled` on a run-wide kill, and a
/// cache hit moves `Pending` straight to `Succeeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardState {
    Pending,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Retrying,
    PermanentlyFailed,
    Cancelled,
}

impl ShardState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ShardState::Succeeded | ShardState::PermanentlyFailed | ShardState::Cancelled
        )
    }

    pub fn can_transition(self, to: ShardState) -> bool {
        use ShardState::*;
        match (self, to) {
            (Pending, Dispatched) | (Pending, Succeeded) => true,
            (Dispatched, Running) | (Dispatched, Failed) => true,
            (Running, Succeeded) | (Running, Failed) => true,
            (Failed, Retrying) | (Failed, PermanentlyFailed) => true,
            (Retrying, Dispatched) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardError {
    pub class: FailureClass,
    pub message: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardRecord {
    pub shard_id: ShardId,
    pub state: ShardState,
    /// Local worker slot, cluster worker id, or sandbox id of the last attempt.
    pub worker: Option<String>,
    pub attempt_count: u32,
    pub start_ts: Option<u64>,
    pub end_ts: Option<u64>,
    pub exit_code: Option<i32>,
    pub stdout_digest: Option<Digest>,
    pub output_digest: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_digest: Option<Digest>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ShardError>,
}

impl ShardRecord {
    pub fn pending(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            state: ShardState::Pending,
            worker: None,
            attempt_count: 0,
            start_ts: None,
            end_ts: None,
            exit_code: None,
            stdout_digest: None,
            output_digest: None,
            package_digest: None,
            cached: false,
            error: None,
        }
    }
}

/// Which limit the governor saw breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetResource {
    Cost,
    Time,
}

/// Terminal failure class of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "class")]
pub enum RunFailure {
    PolicyViolation {
        check: PolicyCheck,
        reason: String,
    },
    /// Operators or the backend could not be resolved for dispatch.
    DispatchFailed {
        message: String,
    },
    PermanentExecution {
        shard_id: ShardId,
        attempts: u32,
        classification: FailureClass,
        message: String,
    },
    BudgetExceeded {
        resource: BudgetResource,
        observed: f64,
        limit: f64,
    },
    ReduceFailed {
        message: String,
    },
    ProduceFailed {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub estimate: f64,
    pub observed: f64,
    pub limit: f64,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub peak_concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEnforcement {
    pub compile_status: PolicyStatus,
    pub dispatch_status: PolicyStatus,
    pub egress_allowlist: Vec<String>,
    pub caps: Caps,
    pub kill_threshold: f64,
    pub killed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub job_id: String,
    pub backend: ExecutionBackend,
    pub ir_digest: Digest,
    pub manifest_digest: Digest,
    pub seed: Seed,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Final shard states in canonical shard-id order.
    pub maps: Vec<ShardRecord>,
    #[serde(rename = "reduce")]
    pub reduce_result: Option<Value>,
    #[serde(rename = "produce")]
    pub produce_result: Option<Value>,
    pub reduce_result_digest: Option<Digest>,
    pub produce_result_digest: Option<Digest>,
    pub reduce_input_order_digest: Option<Digest>,
    pub policy_enforcement: PolicyEnforcement,
    pub costs: CostSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    pub engine_version: String,
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_loop_transitions_are_allowed() {
        use ShardState::*;
        let path = [Pending, Dispatched, Running, Failed, Retrying, Dispatched, Running, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_do_not_move() {
        use ShardState::*;
        assert!(!Succeeded.can_transition(Running));
        assert!(!PermanentlyFailed.can_transition(Retrying));
        assert!(!Cancelled.can_transition(Cancelled));
        assert!(Running.can_transition(Cancelled));
    }

    #[test]
    fn failed_cannot_skip_to_running() {
        assert!(!ShardState::Failed.can_transition(ShardState::Running));
        assert!(!ShardState::Pending.can_transition(ShardState::Running));
    }
}
