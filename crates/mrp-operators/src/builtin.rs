//! Reference operators.
//!
//! | name          | phase   | behavior                                         |
//! |---------------|---------|--------------------------------------------------|
//! | `uppercase`   | map     | `{_shard_id, text}` with `text` uppercased       |
//! | `gc_content`  | map     | fraction of G/C bases in `seq`                   |
//! | `concat`      | reduce  | joins a string field with `separator` (`-`)      |
//! | `average`     | reduce  | mean of a numeric field                          |
//! | `json_writer` | produce | writes the result as canonical JSON to the sink  |

use std::fs;

use mrp_core::canonical::canonical_bytes;
use mrp_core::hash::hash_bytes;
use mrp_core::ir::Seed;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::registry::RegistryBuilder;
use crate::traits::{
    MapOperator, OpError, ProduceContext, ProduceOperator, ReduceOperator, SinkContract,
};

pub fn register(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .map(Uppercase)
        .map(GcContent)
        .reduce(Concat)
        .reduce(Average)
        .produce(JsonWriter)
}

fn shard_id(params: &Value) -> Value {
    params.get("_shard_id").cloned().unwrap_or(json!(0))
}

fn config_str<'a>(config: &'a Value, key: &str, default: &'a str) -> &'a str {
    config.get(key).and_then(Value::as_str).unwrap_or(default)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Uppercase;

impl MapOperator for Uppercase {
    fn name(&self) -> &str {
        "uppercase"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn run(&self, params: &Value, _seed: &Seed) -> Result<Value, OpError> {
        let text = match params.get("text") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                return Err(OpError::Malformed("shard payload has no `text`".into()))
            }
            Some(other) => other.to_string(),
        };
        Ok(json!({ "_shard_id": shard_id(params), "text": text.to_uppercase() }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcContent;

impl MapOperator for GcContent {
    fn name(&self) -> &str {
        "gc_content"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn run(&self, params: &Value, _seed: &Seed) -> Result<Value, OpError> {
        let seq = params
            .get("seq")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_uppercase();
        let gc = if seq.is_empty() {
            0.0
        } else {
            let n = seq.bytes().filter(|b| *b == b'G' || *b == b'C').count();
            n as f64 / seq.len() as f64
        };
        Ok(json!({ "_shard_id": shard_id(params), "gc": gc }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Concat;

impl ReduceOperator for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn run(&self, inputs: &[Value], config: &Value, _seed: &Seed) -> Result<Value, OpError> {
        let separator = config_str(config, "separator", "-");
        let field = config_str(config, "field", "text");
        let parts = inputs
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.get(field)
                    .and_then(Value::as_str)
                    .ok_or_else(|| OpError::Malformed(format!("input {i} has no string `{field}`")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(json!({ "joined": parts.join(separator) }))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Average;

impl ReduceOperator for Average {
    fn name(&self) -> &str {
        "average"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn run(&self, inputs: &[Value], config: &Value, _seed: &Seed) -> Result<Value, OpError> {
        let field = config_str(config, "field", "gc");
        let sum: f64 = inputs
            .iter()
            .map(|v| v.get(field).and_then(Value::as_f64).unwrap_or(0.0))
            .sum();
        let avg = sum / inputs.len().max(1) as f64;
        let mut out = Map::new();
        out.insert(format!("avg_{field}"), json!(avg));
        Ok(Value::Object(out))
    }
}

/// Writes the reduced result into the run's output directory.
///
/// Config: `filename` (default `result.json`). Returns the relative path,
/// byte length and content digest of what was written.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonWriter;

impl ProduceOperator for JsonWriter {
    fn name(&self) -> &str {
        "json_writer"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn sink(&self, config: &Value) -> SinkContract {
        SinkContract {
            destination: config_str(config, "filename", "result.json").to_string(),
            schema_ref: "application/json".into(),
        }
    }

    fn run(
        &self,
        result: &Value,
        config: &Value,
        ctx: &ProduceContext,
        _seed: &Seed,
    ) -> Result<Value, OpError> {
        let sink = self.sink(config);
        let rel = std::path::Path::new(&sink.destination);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(OpError::Sink(format!(
                "destination `{}` escapes the output directory",
                sink.destination
            )));
        }
        let bytes = canonical_bytes(result).map_err(|e| OpError::Malformed(e.to_string()))?;
        let path = ctx.output_dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| OpError::Sink(format!("mkdir: {e}")))?;
        }
        fs::write(&path, &bytes).map_err(|e| OpError::Sink(format!("write {}: {e}", path.display())))?;
        debug!(path = %path.display(), bytes = bytes.len(), replay = ctx.replay, "json_writer wrote result");

        Ok(json!({
            "path": sink.destination,
            "bytes": bytes.len(),
            "digest": hash_bytes(&bytes).to_hex(),
            "result": result,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrp_core::hash::hash_str;

    fn seed() -> Seed {
        Seed(hash_str("seed"))
    }

    #[test]
    fn uppercase_keeps_shard_id() {
        let out = Uppercase
            .run(&json!({"_shard_id": 1, "text": "bar"}), &seed())
            .unwrap();
        assert_eq!(out, json!({"_shard_id": 1, "text": "BAR"}));
    }

    #[test]
    fn uppercase_without_text_is_malformed() {
        let err = Uppercase.run(&json!({"_shard_id": 0}), &seed()).unwrap_err();
        assert!(matches!(err, OpError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn concat_uses_separator_in_input_order() {
        let inputs = vec![json!({"text": "FOO"}), json!({"text": "BAR"})];
        let out = Concat.run(&inputs, &json!({}), &seed()).unwrap();
        assert_eq!(out, json!({"joined": "FOO-BAR"}));
        let out = Concat
            .run(&inputs, &json!({"separator": "+"}), &seed())
            .unwrap();
        assert_eq!(out["joined"], "FOO+BAR");
    }

    #[test]
    fn gc_and_average() {
        let a = GcContent.run(&json!({"_shard_id": 0, "seq": "ggcc"}), &seed()).unwrap();
        let b = GcContent.run(&json!({"_shard_id": 1, "seq": "ATGC"}), &seed()).unwrap();
        assert_eq!(a["gc"], 1.0);
        assert_eq!(b["gc"], 0.5);
        let avg = Average.run(&[a, b], &json!({}), &seed()).unwrap();
        assert_eq!(avg, json!({"avg_gc": 0.75}));
        assert_eq!(Average.run(&[], &json!({}), &seed()).unwrap()["avg_gc"], 0.0);
    }

    #[test]
    fn json_writer_writes_inside_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProduceContext {
            output_dir: dir.path().to_path_buf(),
            replay: false,
        };
        let result = json!({"joined": "FOO-BAR"});
        let out = JsonWriter.run(&result, &json!({}), &ctx, &seed()).unwrap();
        assert_eq!(out["path"], "result.json");
        let written = std::fs::read(dir.path().join("result.json")).unwrap();
        assert_eq!(written, br#"{"joined":"FOO-BAR"}"#.to_vec());
        assert_eq!(out["digest"], hash_bytes(&written).to_hex());
    }

    #[test]
    fn json_writer_refuses_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProduceContext {
            output_dir: dir.path().to_path_buf(),
            replay: false,
        };
        let err = JsonWriter
            .run(&json!({}), &json!({"filename": "../x.json"}), &ctx, &seed())
            .unwrap_err();
        assert!(matches!(err, OpError::Sink(_)));
    }
}
