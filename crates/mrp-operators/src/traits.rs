//! Phase contracts.
//!
//! The runtime calls Map operators once per shard attempt (possibly on a
//! worker pool), then Reduce once over the merged outputs in shard-id order,
//! then Produce once with the reduced result. Only Produce may touch anything
//! outside the artifact store, and only inside `ProduceContext::output_dir`.

use std::path::PathBuf;

use mrp_core::ir::Seed;
use mrp_core::spec::OperatorKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpError {
    /// Transient failure (network, throttling); the shard may be retried.
    #[error("transient operator failure: {0}")]
    Transient(String),

    #[error("execution error: {0}")]
    Exec(String),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("sink error: {0}")]
    Sink(String),
}

impl OpError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OpError::Transient(_))
    }
}

/// Stable identity of an implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorMeta {
    pub name: String,
    pub version: String,
    pub kind: OperatorKind,
}

impl OperatorMeta {
    pub fn new(name: impl Into<String>, version: impl Into<String>, kind: OperatorKind) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            kind,
        }
    }

    /// `name@version`, the reference tasks carry.
    pub fn reference(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

pub trait MapOperator: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// Process one shard. `params` is the shard payload with `_shard_id` injected.
    fn run(&self, params: &Value, seed: &Seed) -> Result<Value, OpError>;
}

pub trait ReduceOperator: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    /// `inputs` arrive strictly in shard-id order.
    fn run(&self, inputs: &[Value], config: &Value, seed: &Seed) -> Result<Value, OpError>;
}

/// Where a Produce operator writes, declared up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkContract {
    /// Destination relative to the run's output directory.
    pub destination: String,
    /// Schema reference for what lands at the destination.
    pub schema_ref: String,
}

#[derive(Debug, Clone)]
pub struct ProduceContext {
    /// Per-run directory; created by the runtime before `run` is called.
    pub output_dir: PathBuf,
    /// Set when re-executing a sealed run.
    pub replay: bool,
}

pub trait ProduceOperator: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn version(&self) -> &str;

    fn sink(&self, config: &Value) -> SinkContract;

    /// Perform the side effect and return a description of it. The returned
    /// value is digested into the run record, so it must not embed the
    /// absolute output directory.
    fn run(
        &self,
        result: &Value,
        config: &Value,
        ctx: &ProduceContext,
        seed: &Seed,
    ) -> Result<Value, OpError>;
}
