//! Seed derivation.
//!
//! seed = BLAKE3(canonical {spec_version, job_id, inputs_digest,
//! operator_versions_digest}). No clock, pid or entropy is involved, so the
//! same normalized spec and operator set always yield the same seed.

use serde::Serialize;

use mrp_core::hash::{hash_canonical, Digest};
use mrp_core::ir::{OperatorSet, Seed};
use mrp_core::spec::{JobSpec, OperatorKind, Shard};

use crate::error::CompileError;

#[derive(Serialize)]
struct SeedMaterial<'a> {
    spec_version: &'a str,
    job_id: &'a str,
    inputs_digest: Digest,
    operator_versions_digest: Digest,
}

#[derive(Serialize, PartialEq, Eq, PartialOrd, Ord)]
struct VersionEntry<'a> {
    kind: OperatorKind,
    name: &'a str,
    version: &'a str,
    digest: Digest,
}

/// Digest of the canonical (id-ordered) shard list.
pub fn inputs_digest(shards: &[Shard]) -> Result<Digest, CompileError> {
    Ok(hash_canonical(shards)?)
}

/// Digest of the sorted operator identity set.
pub fn operator_versions_digest(operators: &OperatorSet) -> Result<Digest, CompileError> {
    let mut entries: Vec<VersionEntry<'_>> = operators
        .iter()
        .map(|op| VersionEntry {
            kind: op.kind,
            name: &op.name,
            version: &op.version,
            digest: op.digest,
        })
        .collect();
    entries.sort();
    Ok(hash_canonical(&entries)?)
}

pub fn derive_seed(spec: &JobSpec, operators: &OperatorSet) -> Result<Seed, CompileError> {
    let material = SeedMaterial {
        spec_version: &spec.version,
        job_id: &spec.job_id,
        inputs_digest: inputs_digest(spec.inputs())?,
        operator_versions_digest: operator_versions_digest(operators)?,
    };
    Ok(Seed(hash_canonical(&material)?))
}
