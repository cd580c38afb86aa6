#![forbid(unsafe_code)]
//! mrp-exec: dispatcher, backends, governance, merge, run records and replay.
//!
//! A run takes a compiled IR + manifest, re-checks policy, fans the Map tasks
//! out through one `ShardExecutor` (local pool, cluster, or per-shard
//! sandboxes) under the retry controller and budget governor, merges shard
//! outputs back into shard-id order, then runs Reduce and Produce locally.
//! Whatever happens, the run ends in exactly one sealed `RunRecord` stored by
//! digest.

pub mod backend;
pub mod error;
pub mod governor;
pub mod merge;
pub mod metrics;
pub mod record;
pub mod replay;
pub mod retry;
pub mod runtime;
pub mod scheduler;

pub use backend::{AttemptContext, AttemptError, AttemptOutput, ShardExecutor};
pub use error::ExecError;
pub use governor::{CancelSignal, CostMeter, Governor, WeightMeter};
pub use replay::{FieldDiff, ReplayReport};
pub use retry::BackoffPolicy;
pub use runtime::{Engine, EngineBuilder, RunOutcome};
