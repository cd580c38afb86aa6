//! Replay: re-execute a sealed run from its stored IR snapshot and compare
//! the digests that define its result.

use serde::Serialize;

use mrp_core::hash::Digest;
use mrp_core::ir::{Ir, Manifest};
use mrp_core::record::RunRecord;
use tracing::{info, warn};

use crate::error::ExecError;
use crate::metrics::emit_span;
use crate::record::load_record;
use crate::runtime::{Engine, RunMode};

/// One digest that differs between the original run and its replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiff {
    pub field: String,
    pub expected: Option<Digest>,
    pub actual: Option<Digest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    /// Digest of the run that was replayed.
    pub original: Digest,
    /// Digest of the replay's own sealed record.
    pub replay: Digest,
    pub matched: bool,
    pub diffs: Vec<FieldDiff>,
    #[serde(skip)]
    pub record: RunRecord,
}

impl ReplayReport {
    pub fn into_result(self) -> Result<Self, ExecError> {
        if self.matched {
            Ok(self)
        } else {
            Err(ExecError::ReplayMismatch {
                fields: self.diffs.into_iter().map(|d| d.field).collect(),
            })
        }
    }
}

/// Field-by-field comparison of the result-defining digests.
pub fn compare(original: &RunRecord, replayed: &RunRecord) -> Vec<FieldDiff> {
    [
        (
            "reduce_result_digest",
            original.reduce_result_digest,
            replayed.reduce_result_digest,
        ),
        (
            "produce_result_digest",
            original.produce_result_digest,
            replayed.produce_result_digest,
        ),
        (
            "reduce_input_order_digest",
            original.reduce_input_order_digest,
            replayed.reduce_input_order_digest,
        ),
    ]
    .into_iter()
    .filter(|(_, expected, actual)| expected != actual)
    .map(|(field, expected, actual)| FieldDiff {
        field: field.to_string(),
        expected,
        actual,
    })
    .collect()
}

impl Engine {
    /// Re-run the IR behind `run_digest` with the same seed and compare.
    ///
    /// A mismatch is reported, not raised; `ReplayReport::into_result` turns
    /// it into `ExecError::ReplayMismatch`.
    pub async fn replay(&self, run_digest: &Digest) -> Result<ReplayReport, ExecError> {
        let original = load_record(self.store(), run_digest)?;
        let ir: Ir = self.store().get_verified(&original.ir_digest)?.json()?;
        let manifest: Manifest = self.store().get_verified(&original.manifest_digest)?.json()?;
        if ir.seed != original.seed {
            return Err(ExecError::Invalid(format!(
                "IR snapshot {} does not carry the recorded seed",
                original.ir_digest.short()
            )));
        }
        info!(job_id = %original.job_id, run = %run_digest.short(), "replaying run");

        let outcome = self.execute(&ir, &manifest, RunMode::Replay).await?;
        let diffs = compare(&original, &outcome.record);
        let matched = diffs.is_empty();
        if matched {
            info!(run = %run_digest.short(), replay = %outcome.digest.short(), "replay matched");
        } else {
            let fields: Vec<&str> = diffs.iter().map(|d| d.field.as_str()).collect();
            warn!(run = %run_digest.short(), ?fields, "replay mismatch");
        }
        emit_span(
            "replay.compared",
            &[
                ("original", run_digest.to_hex()),
                ("replay", outcome.digest.to_hex()),
                ("matched", matched.to_string()),
            ],
        );
        Ok(ReplayReport {
            original: *run_digest,
            replay: outcome.digest,
            matched,
            diffs,
            record: outcome.record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use mrp_core::config::EngineConfig;
    use mrp_core::hash::hash_str;
    use mrp_operators::OperatorRegistry;
    use mrp_store::ArtifactStore;
    use tempfile::TempDir;

    const TOY: &str = r#"
job_id: toy
map:
  operator: uppercase
  shards:
    - { id: 1, text: bar }
    - { id: 0, text: foo }
reduce: { operator: concat, config: { separator: "-" } }
produce: { operator: json_writer }
"#;

    fn engine(dir: &TempDir) -> Engine {
        let cfg = EngineConfig {
            outputs_dir: dir.path().display().to_string(),
            ..EngineConfig::default()
        };
        Engine::builder(cfg, Arc::new(OperatorRegistry::with_builtins().unwrap()))
            .store(ArtifactStore::in_memory())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn replay_of_sealed_run_matches() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let original = engine.run_str(TOY).await.unwrap();
        assert!(original.succeeded());

        let report = engine.replay(&original.digest).await.unwrap();
        assert!(report.matched, "{:?}", report.diffs);
        assert!(report.diffs.is_empty());
        assert_ne!(report.replay, original.digest);
        assert_eq!(report.record.ir_digest, original.record.ir_digest);

        // replays write beside, never over, the original output
        let replay_dir = report.record.output_dir.clone().unwrap();
        assert!(replay_dir.contains("replays"));
        assert_ne!(Some(replay_dir), original.record.output_dir);
        assert!(report.into_result().is_ok());
    }

    #[tokio::test]
    async fn unknown_run_digest_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = engine(&dir).replay(&hash_str("nope")).await.unwrap_err();
        assert!(matches!(err, ExecError::Store(_)));
    }

    #[test]
    fn compare_names_each_differing_field() {
        let base = RunRecord {
            reduce_result_digest: Some(hash_str("a")),
            produce_result_digest: Some(hash_str("p")),
            reduce_input_order_digest: Some(hash_str("o")),
            ..sample_record()
        };
        let mut other = base.clone();
        assert!(compare(&base, &other).is_empty());

        other.reduce_result_digest = Some(hash_str("b"));
        other.produce_result_digest = None;
        let diffs = compare(&base, &other);
        let fields: Vec<&str> = diffs.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["reduce_result_digest", "produce_result_digest"]);
        assert_eq!(diffs[1].actual, None);

        let report = ReplayReport {
            original: hash_str("r1"),
            replay: hash_str("r2"),
            matched: false,
            diffs,
            record: other,
        };
        match report.into_result() {
            Err(ExecError::ReplayMismatch { fields }) => assert_eq!(fields.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn sample_record() -> RunRecord {
        use crate::record::{RecordAssembler, RunHeader};
        use mrp_core::id::RunId;
        use mrp_core::ir::Seed;
        use mrp_core::policy::{Caps, PolicyStatus};
        use mrp_core::record::PolicyEnforcement;
        use mrp_core::spec::ExecutionBackend;

        RecordAssembler::new(
            RunHeader {
                run_id: RunId::new(),
                job_id: "toy".into(),
                backend: ExecutionBackend::Local,
                ir_digest: hash_str("ir"),
                manifest_digest: hash_str("manifest"),
                seed: Seed(hash_str("seed")),
                started_ms: 0,
            },
            PolicyEnforcement {
                compile_status: PolicyStatus::Ok,
                dispatch_status: PolicyStatus::Ok,
                egress_allowlist: Vec::new(),
                caps: Caps {
                    workers: 1,
                    time_s: 60,
                    mem_mb: 512,
                },
                kill_threshold: 1.2,
                killed: false,
            },
        )
        .seal(None)
    }
}
