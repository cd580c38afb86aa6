//! Compiled intermediate representation and its provenance manifest.
//!
//! The compiler emits `Ir` + `Manifest` as a pure function of the normalized
//! spec, the resolved operator set, and the seed. Nothing here carries a
//! timestamp or random value, so equal inputs serialize to equal bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash::Digest;
use crate::id::ShardId;
use crate::spec::{ExecutionBackend, OperatorKind, ResourceRequest};

/// The single deterministic seed handed to every operator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seed(pub Digest);

impl Seed {
    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl std::fmt::Display for Seed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a resolved operator came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OperatorSource {
    Registered,
    /// Generated code stored as a content-addressed package.
    Generated { package: Digest, entrypoint: String },
}

/// Resolved operator identity pinned into the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorIdentity {
    /// Stable reference used by tasks (`name@version`).
    pub reference: String,
    pub name: String,
    pub kind: OperatorKind,
    pub version: String,
    pub digest: Digest,
    pub source: OperatorSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSet {
    pub map: OperatorIdentity,
    pub reduce: OperatorIdentity,
    pub produce: OperatorIdentity,
}

impl OperatorSet {
    pub fn iter(&self) -> impl Iterator<Item = &OperatorIdentity> {
        [&self.map, &self.reduce, &self.produce].into_iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapTask {
    pub shard_id: ShardId,
    pub operator: String,
    pub params: Value,
    /// Digest of (operator digest, params, seed); the shard cache key.
    pub task_key: Digest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceTask {
    pub operator: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceTask {
    pub operator: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ir {
    pub job_id: String,
    pub backend: ExecutionBackend,
    /// One task per shard, in canonical shard-id order.
    pub maps: Vec<MapTask>,
    /// Shard cache enabled for the Map phase.
    pub map_cache: bool,
    pub reduce: ReduceTask,
    pub produce: ProduceTask,
    pub seed: Seed,
    /// Inputs the policy engine re-checks at dispatch.
    pub sandbox_profile_ref: Option<String>,
    pub resources: ResourceRequest,
    pub egress: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub job_id: String,
    pub spec_version: String,
    pub operators: OperatorSet,
    pub seed: Seed,
    pub engine_version: String,
}
