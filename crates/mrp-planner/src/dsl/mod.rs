//! Job spec front end.
//!
//! Example:
//! ```yaml
//! version: v0
//! job_id: toy
//! map:
//!   operator: uppercase
//!   shards:
//!     - { id: 0, text: foo }
//!     - { id: 1, text: bar }
//! reduce:
//!   operator: concat
//!   config: { separator: "-" }
//! produce:
//!   operator: json_writer@1.0.0
//! execution_backend: local
//! ```
//!
//! JSON is accepted too (YAML is a superset).

pub mod schema;

use std::path::Path;

use serde_json::Value;

use crate::error::CompileError;

pub use schema::{validate, RawJob, RawMap, RawPhase};

/// Parse YAML or JSON text into a generic value.
pub fn parse_job_str(src: &str) -> Result<Value, CompileError> {
    let value: Value =
        serde_yaml::from_str(src).map_err(|e| CompileError::schema("$", e.to_string()))?;
    if !value.is_object() {
        return Err(CompileError::schema("$", "job spec must be a mapping"));
    }
    Ok(value)
}

pub fn load_job_file(path: impl AsRef<Path>) -> Result<Value, CompileError> {
    let path = path.as_ref();
    let src = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_job_str(&src)
}
