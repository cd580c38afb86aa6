//! Normalized job specification.
//!
//! The planner's DSL layer produces a `JobSpec` after validation and
//! canonicalization; from that point on it is immutable and safe to hash.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::ShardId;

/// Where the Map phase runs. Reduce and Produce are always local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    #[default]
    Local,
    Distributed,
    SandboxedRemote,
}

impl ExecutionBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionBackend::Local => "local",
            ExecutionBackend::Distributed => "distributed",
            ExecutionBackend::SandboxedRemote => "sandboxed_remote",
        }
    }
}

impl std::fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator capability: which phase contract an operator implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    Map,
    Reduce,
    Produce,
}

impl OperatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorKind::Map => "map",
            OperatorKind::Reduce => "reduce",
            OperatorKind::Produce => "produce",
        }
    }

    /// The entrypoint signature every operator of this kind must declare.
    pub fn expected_signature(&self) -> &'static str {
        match self {
            OperatorKind::Map => "run(params, seed)",
            OperatorKind::Reduce => "run(inputs, seed)",
            OperatorKind::Produce => "run(result, seed)",
        }
    }
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator code supplied inline in the job spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub entrypoint: String,
    pub kind: OperatorKind,
    /// Declared entrypoint signature; defaults to the kind's expected one.
    #[serde(default)]
    pub signature: Option<String>,
    pub source: String,
    /// Dependency manifest (sorted, deduplicated by the normalizer).
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorRef {
    /// A module in the injected registry, optionally pinned to a version.
    Registered {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
    Generated(GeneratedCode),
}

impl OperatorRef {
    pub fn registered(name: impl Into<String>) -> Self {
        OperatorRef::Registered {
            name: name.into(),
            version: None,
        }
    }

    /// Short human-readable label for errors and logs.
    pub fn label(&self) -> String {
        match self {
            OperatorRef::Registered {
                name,
                version: Some(v),
            } => format!("{name}@{v}"),
            OperatorRef::Registered { name, version: None } => name.clone(),
            OperatorRef::Generated(code) => format!("generated:{}", code.entrypoint),
        }
    }
}

/// One unit of Map work with its canonical identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSection {
    pub operator: OperatorRef,
    /// Sorted by `id` ascending; ids are unique.
    pub shards: Vec<Shard>,
    /// Content-addressed shard caching for this phase.
    pub cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSection {
    pub operator: OperatorRef,
    /// Canonicalized (sorted keys) config mapping.
    pub config: Value,
}

/// Caps requested by the job. Missing values inherit configured limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub time_s: Option<u64>,
    #[serde(default)]
    pub mem_mb: Option<u64>,
    #[serde(default)]
    pub max_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub version: String,
    pub job_id: String,
    pub map: MapSection,
    pub reduce: PhaseSection,
    pub produce: PhaseSection,
    pub execution_backend: ExecutionBackend,
    pub sandbox_profile_ref: Option<String>,
    pub resources: ResourceRequest,
    /// Requested egress hosts (sorted, deduplicated).
    pub egress: Vec<String>,
}

impl JobSpec {
    /// The canonical input set that the seed is derived from.
    pub fn inputs(&self) -> &[Shard] {
        &self.map.shards
    }
}
