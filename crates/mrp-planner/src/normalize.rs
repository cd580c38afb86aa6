//! Canonical normalization: `RawJob` → `JobSpec`.
//!
//! After this step nothing about the spec depends on the order fields or
//! shards were written in: shards carry explicit ids and are sorted by them,
//! config mappings have sorted keys, and list-valued sets (egress, generated
//! dependencies) are sorted and deduplicated.

use std::collections::BTreeMap;

use serde_json::Value;

use mrp_core::canonical::sort_keys;
use mrp_core::id::ShardId;
use mrp_core::spec::{
    JobSpec, MapSection, OperatorRef, PhaseSection, ResourceRequest, Shard,
};

use crate::dsl::{self, RawJob, RawPhase};
use crate::error::CompileError;

pub const DEFAULT_SPEC_VERSION: &str = "v0";
pub const SHARD_ID_KEY: &str = "_shard_id";

/// Explicit id from `id` / `_shard_id`, if the payload carries one.
fn explicit_id(payload: &Value, path: &str) -> Result<Option<u64>, CompileError> {
    let Some(obj) = payload.as_object() else {
        return Ok(None);
    };
    let mut found: Option<u64> = None;
    for key in ["id", SHARD_ID_KEY] {
        let Some(v) = obj.get(key).filter(|v| !v.is_null()) else {
            continue;
        };
        let id = v.as_u64().ok_or_else(|| {
            CompileError::schema(format!("{path}.{key}"), "shard id must be a non-negative integer")
        })?;
        match found {
            Some(prev) if prev != id => {
                return Err(CompileError::schema(
                    path,
                    format!("`id` ({prev}) and `_shard_id` ({id}) disagree"),
                ))
            }
            _ => found = Some(id),
        }
    }
    Ok(found)
}

fn normalize_shards(raw: Vec<Value>) -> Result<Vec<Shard>, CompileError> {
    let mut by_id: BTreeMap<u64, Value> = BTreeMap::new();
    for (pos, payload) in raw.into_iter().enumerate() {
        let path = format!("map.shards[{pos}]");
        let id = explicit_id(&payload, &path)?.unwrap_or(pos as u64);
        let mut payload = sort_keys(payload);
        if let Value::Object(obj) = &mut payload {
            obj.insert(SHARD_ID_KEY.to_string(), Value::from(id));
        }
        if by_id.insert(id, payload).is_some() {
            return Err(CompileError::schema(path, format!("duplicate shard id {id}")));
        }
    }
    Ok(by_id
        .into_iter()
        .map(|(id, payload)| Shard {
            id: ShardId::new(id),
            payload,
        })
        .collect())
}

fn normalize_operator(op: OperatorRef) -> OperatorRef {
    match op {
        OperatorRef::Generated(mut code) => {
            code.dependencies.sort();
            code.dependencies.dedup();
            OperatorRef::Generated(code)
        }
        other => other,
    }
}

fn normalize_phase(raw: RawPhase) -> PhaseSection {
    PhaseSection {
        operator: normalize_operator(raw.operator),
        config: sort_keys(Value::Object(raw.config.unwrap_or_default())),
    }
}

pub fn normalize(raw: RawJob) -> Result<JobSpec, CompileError> {
    let shards = normalize_shards(raw.map.shards)?;

    let mut egress: Vec<String> = raw
        .egress
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    egress.sort();
    egress.dedup();

    Ok(JobSpec {
        version: raw
            .version
            .unwrap_or_else(|| DEFAULT_SPEC_VERSION.to_string()),
        job_id: raw.job_id,
        map: MapSection {
            operator: normalize_operator(raw.map.operator),
            shards,
            cache: raw.map.cache.unwrap_or(true),
        },
        reduce: normalize_phase(raw.reduce),
        produce: normalize_phase(raw.produce),
        execution_backend: raw.execution_backend.unwrap_or_default(),
        sandbox_profile_ref: raw.sandbox_profile_ref,
        resources: raw.resources.unwrap_or_else(ResourceRequest::default),
        egress,
    })
}

/// Validate and normalize a parsed document.
pub fn normalize_document(doc: &Value) -> Result<JobSpec, CompileError> {
    normalize(dsl::validate(doc)?)
}

/// Parse, validate and normalize YAML/JSON text.
pub fn normalize_str(src: &str) -> Result<JobSpec, CompileError> {
    normalize_document(&dsl::parse_job_str(src)?)
}
