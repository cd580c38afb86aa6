//! Structural validation.
//!
//! Walks the parsed document against the allowed field sets so an unknown or
//! mistyped field is reported with its full path (`map.operatr`,
//! `reduce.generated.knd`). Shard payloads and `config` mappings are
//! free-form and are not walked.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use mrp_core::spec::{ExecutionBackend, GeneratedCode, OperatorRef, ResourceRequest};

use crate::error::CompileError;

const TOP_LEVEL: &[&str] = &[
    "version",
    "job_id",
    "map",
    "reduce",
    "produce",
    "execution_backend",
    "sandbox_profile_ref",
    "resources",
    "egress",
];
const MAP_FIELDS: &[&str] = &["operator", "generated", "shards", "cache"];
const PHASE_FIELDS: &[&str] = &["operator", "generated", "config"];
const OPERATOR_FIELDS: &[&str] = &["name", "version"];
const GENERATED_FIELDS: &[&str] = &["entrypoint", "kind", "signature", "source", "dependencies"];
const RESOURCE_FIELDS: &[&str] = &["workers", "time_s", "mem_mb", "max_cost"];

/// Structurally valid, not yet normalized job.
#[derive(Debug, Clone, PartialEq)]
pub struct RawJob {
    pub version: Option<String>,
    pub job_id: String,
    pub map: RawMap,
    pub reduce: RawPhase,
    pub produce: RawPhase,
    pub execution_backend: Option<ExecutionBackend>,
    pub sandbox_profile_ref: Option<String>,
    pub resources: Option<ResourceRequest>,
    pub egress: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawMap {
    pub operator: OperatorRef,
    pub shards: Vec<Value>,
    pub cache: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPhase {
    pub operator: OperatorRef,
    pub config: Option<Map<String, Value>>,
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn as_object<'a>(v: &'a Value, path: &str) -> Result<&'a Map<String, Value>, CompileError> {
    v.as_object()
        .ok_or_else(|| CompileError::schema(path, "expected a mapping"))
}

fn reject_unknown(
    obj: &Map<String, Value>,
    allowed: &[&str],
    path: &str,
) -> Result<(), CompileError> {
    // serde_json maps iterate in key order, so the first unknown key is stable.
    match obj.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(k) => Err(CompileError::schema(join(path, k), "unknown field")),
        None => Ok(()),
    }
}

/// Optional field; an explicit `null` counts as absent.
fn optional<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn required<'a>(
    obj: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Value, CompileError> {
    optional(obj, key).ok_or_else(|| CompileError::schema(join(path, key), "missing required field"))
}

fn typed<T: DeserializeOwned>(v: &Value, path: &str) -> Result<T, CompileError> {
    serde_json::from_value(v.clone()).map_err(|e| CompileError::schema(path, e.to_string()))
}

fn non_empty_string(v: &Value, path: &str) -> Result<String, CompileError> {
    match v.as_str().map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        Some(_) => Err(CompileError::schema(path, "must not be empty")),
        None => Err(CompileError::schema(path, "expected a string")),
    }
}

/// `name`, `name@version`, or `{name, version}`.
fn operator_ref(v: &Value, path: &str) -> Result<OperatorRef, CompileError> {
    match v {
        Value::String(_) => {
            let s = non_empty_string(v, path)?;
            match s.split_once('@') {
                Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                    Ok(OperatorRef::Registered {
                        name: name.to_string(),
                        version: Some(version.to_string()),
                    })
                }
                Some(_) => Err(CompileError::schema(path, "expected `name@version`")),
                None => Ok(OperatorRef::registered(s)),
            }
        }
        Value::Object(obj) => {
            reject_unknown(obj, OPERATOR_FIELDS, path)?;
            let name = non_empty_string(required(obj, "name", path)?, &join(path, "name"))?;
            let version = optional(obj, "version")
                .map(|v| non_empty_string(v, &join(path, "version")))
                .transpose()?;
            Ok(OperatorRef::Registered { name, version })
        }
        _ => Err(CompileError::schema(path, "expected an operator name or mapping")),
    }
}

fn generated(v: &Value, path: &str) -> Result<OperatorRef, CompileError> {
    let obj = as_object(v, path)?;
    reject_unknown(obj, GENERATED_FIELDS, path)?;
    for key in ["entrypoint", "kind", "source"] {
        required(obj, key, path)?;
    }
    let code: GeneratedCode = typed(v, path)?;
    if code.entrypoint.trim().is_empty() {
        return Err(CompileError::schema(join(path, "entrypoint"), "must not be empty"));
    }
    Ok(OperatorRef::Generated(code))
}

/// Exactly one of `operator` / `generated`.
fn phase_operator(obj: &Map<String, Value>, path: &str) -> Result<OperatorRef, CompileError> {
    match (optional(obj, "operator"), optional(obj, "generated")) {
        (Some(op), None) => operator_ref(op, &join(path, "operator")),
        (None, Some(code)) => generated(code, &join(path, "generated")),
        (Some(_), Some(_)) => Err(CompileError::schema(
            path,
            "`operator` and `generated` are mutually exclusive",
        )),
        (None, None) => Err(CompileError::schema(
            join(path, "operator"),
            "missing required field",
        )),
    }
}

fn phase(v: &Value, path: &str) -> Result<RawPhase, CompileError> {
    let obj = as_object(v, path)?;
    reject_unknown(obj, PHASE_FIELDS, path)?;
    let operator = phase_operator(obj, path)?;
    let config = optional(obj, "config")
        .map(|c| as_object(c, &join(path, "config")).cloned())
        .transpose()?;
    Ok(RawPhase { operator, config })
}

fn map_section(v: &Value, path: &str) -> Result<RawMap, CompileError> {
    let obj = as_object(v, path)?;
    reject_unknown(obj, MAP_FIELDS, path)?;
    let operator = phase_operator(obj, path)?;
    let shards = match optional(obj, "shards") {
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(CompileError::schema(join(path, "shards"), "expected a list")),
        None => Vec::new(),
    };
    let cache = optional(obj, "cache")
        .map(|c| typed::<bool>(c, &join(path, "cache")))
        .transpose()?;
    Ok(RawMap {
        operator,
        shards,
        cache,
    })
}

fn job_id(v: &Value) -> Result<String, CompileError> {
    let id = non_empty_string(v, "job_id")?;
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != "..";
    if !ok {
        return Err(CompileError::schema(
            "job_id",
            "may only contain ASCII letters, digits, `-`, `_` and `.`",
        ));
    }
    Ok(id)
}

/// Validate the document structure and extract typed sections.
pub fn validate(doc: &Value) -> Result<RawJob, CompileError> {
    let obj = as_object(doc, "$")?;
    reject_unknown(obj, TOP_LEVEL, "")?;

    let version = optional(obj, "version")
        .map(|v| non_empty_string(v, "version"))
        .transpose()?;
    let job_id = job_id(required(obj, "job_id", "")?)?;
    let map = map_section(required(obj, "map", "")?, "map")?;
    let reduce = phase(required(obj, "reduce", "")?, "reduce")?;
    let produce = phase(required(obj, "produce", "")?, "produce")?;

    let execution_backend = optional(obj, "execution_backend")
        .map(|v| typed::<ExecutionBackend>(v, "execution_backend"))
        .transpose()?;
    let sandbox_profile_ref = optional(obj, "sandbox_profile_ref")
        .map(|v| non_empty_string(v, "sandbox_profile_ref"))
        .transpose()?;
    let resources = match optional(obj, "resources") {
        Some(v) => {
            reject_unknown(as_object(v, "resources")?, RESOURCE_FIELDS, "resources")?;
            Some(typed::<ResourceRequest>(v, "resources")?)
        }
        None => None,
    };
    let egress = match optional(obj, "egress") {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, h)| non_empty_string(h, &format!("egress[{i}]")))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(CompileError::schema("egress", "expected a list of hosts")),
        None => Vec::new(),
    };

    Ok(RawJob {
        version,
        job_id,
        map,
        reduce,
        produce,
        execution_backend,
        sandbox_profile_ref,
        resources,
        egress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Value {
        json!({
            "job_id": "toy",
            "map": {"operator": "uppercase", "shards": [{"text": "foo"}]},
            "reduce": {"operator": "concat"},
            "produce": {"operator": "json_writer"}
        })
    }

    fn path_of(err: CompileError) -> String {
        match err {
            CompileError::SchemaValidation { path, .. } => path,
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn minimal_spec_validates() {
        let raw = validate(&base()).unwrap();
        assert_eq!(raw.job_id, "toy");
        assert_eq!(raw.map.operator, OperatorRef::registered("uppercase"));
        assert!(raw.reduce.config.is_none());
        assert!(raw.execution_backend.is_none());
    }

    #[test]
    fn unknown_nested_field_names_its_path() {
        let mut doc = base();
        doc["map"]["operatr"] = json!("x");
        assert_eq!(path_of(validate(&doc).unwrap_err()), "map.operatr");

        let mut doc = base();
        doc["reduce"]["extra"] = json!(1);
        assert_eq!(path_of(validate(&doc).unwrap_err()), "reduce.extra");

        let mut doc = base();
        doc["surprise"] = json!(true);
        assert_eq!(path_of(validate(&doc).unwrap_err()), "surprise");
    }

    #[test]
    fn free_form_payloads_are_not_walked() {
        let mut doc = base();
        doc["map"]["shards"] = json!([{"anything": {"nested": 1}}]);
        doc["reduce"]["config"] = json!({"whatever": [1, 2]});
        assert!(validate(&doc).is_ok());
    }

    #[test]
    fn versioned_operator_reference() {
        let mut doc = base();
        doc["produce"]["operator"] = json!("json_writer@1.0.0");
        doc["reduce"]["operator"] = json!({"name": "concat", "version": "1.0.0"});
        let raw = validate(&doc).unwrap();
        assert_eq!(
            raw.produce.operator,
            OperatorRef::Registered {
                name: "json_writer".into(),
                version: Some("1.0.0".into())
            }
        );
        assert!(matches!(raw.reduce.operator, OperatorRef::Registered { version: Some(_), .. }));
    }

    #[test]
    fn generated_block_is_checked() {
        let mut doc = base();
        doc["map"] = json!({
            "generated": {"entrypoint": "GCContentAgent", "kind": "map", "source": "..."},
            "shards": []
        });
        assert!(matches!(validate(&doc).unwrap().map.operator, OperatorRef::Generated(_)));

        doc["map"]["generated"]["knd"] = json!("map");
        assert_eq!(path_of(validate(&doc).unwrap_err()), "map.generated.knd");
    }

    #[test]
    fn operator_and_generated_are_exclusive() {
        let mut doc = base();
        doc["reduce"]["generated"] =
            json!({"entrypoint": "R", "kind": "reduce", "source": "..."});
        assert_eq!(path_of(validate(&doc).unwrap_err()), "reduce");
    }

    #[test]
    fn missing_and_mistyped_fields() {
        let mut doc = base();
        doc.as_object_mut().unwrap().remove("produce");
        assert_eq!(path_of(validate(&doc).unwrap_err()), "produce");

        let mut doc = base();
        doc["execution_backend"] = json!("mainframe");
        assert_eq!(path_of(validate(&doc).unwrap_err()), "execution_backend");

        let mut doc = base();
        doc["resources"] = json!({"workers": 2, "gpus": 1});
        assert_eq!(path_of(validate(&doc).unwrap_err()), "resources.gpus");

        let mut doc = base();
        doc["job_id"] = json!("../escape");
        assert_eq!(path_of(validate(&doc).unwrap_err()), "job_id");
    }
}
