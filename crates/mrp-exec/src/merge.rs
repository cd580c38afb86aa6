//! Result merge: Map outputs back into canonical shard-id order.
//!
//! Records may arrive in any order; outputs are read back from the store,
//! re-hashed against the digests the records carry, and arranged by shard
//! id. The order digest covers the ordered `(shard_id, output_digest)` list,
//! so anyone holding the records can check what Reduce was fed.

use mrp_core::hash::{hash_canonical, Digest};
use mrp_core::id::ShardId;
use mrp_core::record::{ShardRecord, ShardState};
use mrp_store::ArtifactStore;
use serde::Serialize;
use serde_json::Value;

use crate::error::ExecError;

#[derive(Debug, Clone, PartialEq)]
pub struct MergedInputs {
    pub values: Vec<Value>,
    pub order_digest: Digest,
}

#[derive(Serialize)]
struct OrderEntry {
    shard_id: ShardId,
    output_digest: Digest,
}

/// Digest of the ordered `(shard_id, output_digest)` sequence.
pub fn input_order_digest(records: &[ShardRecord]) -> Result<Digest, ExecError> {
    let mut entries = records
        .iter()
        .map(|r| {
            let output_digest = r.output_digest.ok_or_else(|| {
                ExecError::Invalid(format!("{} has no output digest", r.shard_id))
            })?;
            Ok(OrderEntry {
                shard_id: r.shard_id,
                output_digest,
            })
        })
        .collect::<Result<Vec<_>, ExecError>>()?;
    entries.sort_by_key(|e| e.shard_id.get());
    Ok(hash_canonical(&entries)?)
}

pub fn merge_outputs(store: &ArtifactStore, records: &[ShardRecord]) -> Result<MergedInputs, ExecError> {
    let mut ordered: Vec<&ShardRecord> = records.iter().collect();
    ordered.sort_by_key(|r| r.shard_id.get());
    if let Some(pair) = ordered.windows(2).find(|w| w[0].shard_id == w[1].shard_id) {
        return Err(ExecError::Invalid(format!("duplicate record for {}", pair[0].shard_id)));
    }

    let mut values = Vec::with_capacity(ordered.len());
    for record in &ordered {
        if record.state != ShardState::Succeeded {
            return Err(ExecError::Invalid(format!(
                "cannot merge {} in state {:?}",
                record.shard_id, record.state
            )));
        }
        let digest = record.output_digest.ok_or_else(|| {
            ExecError::Invalid(format!("{} has no output digest", record.shard_id))
        })?;
        values.push(store.get_verified(&digest)?.json::<Value>()?);
    }

    Ok(MergedInputs {
        values,
        order_digest: input_order_digest(records)?,
    })
}
