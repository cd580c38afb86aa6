#![forbid(unsafe_code)]
//! mrp-planner: job spec → normalized spec → IR + manifest + policy report.
//!
//! Pipeline:
//! - `dsl`: YAML/JSON text → structurally validated `RawJob` (unknown fields
//!   are rejected with their path)
//! - `normalize`: shard ids, canonical ordering, canonical config → `JobSpec`
//! - `compile`: operator resolution against the injected registry, seed
//!   derivation (`seed`), task keys, cost estimate (`cost`), and the policy
//!   gate (`policy`)
//!
//! Everything here is pure: the same spec and registry always compile to
//! byte-identical output.

pub mod compile;
pub mod cost;
pub mod dsl;
pub mod error;
pub mod normalize;
pub mod policy;
pub mod seed;

pub use compile::{task_key, Compiled, Compiler};
pub use cost::estimate_cost;
pub use dsl::{load_job_file, parse_job_str};
pub use error::CompileError;
pub use normalize::{normalize, normalize_document, normalize_str};
pub use policy::{PolicyEngine, PolicyRequest};
pub use seed::derive_seed;
