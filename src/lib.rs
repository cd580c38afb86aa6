#![forbid(unsafe_code)]
//! MRP: deterministic Map/Reduce/Produce job compiler and runtime.
//!
//! Re-exports the workspace crates so applications and the integration tests
//! can depend on a single package.

pub use mrp_core as core;
pub use mrp_exec as exec;
pub use mrp_operators as operators;
pub use mrp_planner as planner;
pub use mrp_store as store;

pub use mrp_core::config::EngineConfig;
pub use mrp_exec::{Engine, ExecError, ReplayReport, RunOutcome};
pub use mrp_operators::OperatorRegistry;
pub use mrp_planner::{Compiled, Compiler};
