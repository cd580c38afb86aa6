//! Convenient re-exports for downstream crates.

pub use crate::canonical::{canonical_bytes, canonical_value};
pub use crate::config::{CostModel, EngineConfig, PolicyLimits, SandboxProfile};
pub use crate::error::{Error, Result};
pub use crate::hash::{hash_bytes, hash_canonical, Digest};
pub use crate::id::{RunId, ShardId};
pub use crate::ir::{Ir, Manifest, MapTask, OperatorIdentity, ProduceTask, ReduceTask, Seed};
pub use crate::policy::{PolicyReport, PolicyStatus};
pub use crate::record::{RunRecord, ShardRecord, ShardState};
pub use crate::spec::{ExecutionBackend, JobSpec, OperatorKind, OperatorRef};
