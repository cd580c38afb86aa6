//! Generated-code operator packages.
//!
//! A job may carry operator source inline instead of naming a registered
//! module. The compiler turns that block into an `OperatorPackage`, checks its
//! declared capability against the phase it is used in, and stores it by
//! digest; the digest doubles as the operator version. Executing the source
//! is delegated to a `PackageRunner` (or, for sandboxes, the package is
//! shipped as-is).

use std::sync::Arc;

use mrp_core::hash::{hash_canonical, Digest};
use mrp_core::ir::Seed;
use mrp_core::spec::{GeneratedCode, OperatorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::{MapOperator, OpError, ProduceContext, ProduceOperator, ReduceOperator, SinkContract};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorPackage {
    pub entrypoint: String,
    pub kind: OperatorKind,
    pub signature: String,
    pub source: String,
    /// Sorted, deduplicated dependency manifest.
    pub dependencies: Vec<String>,
}

impl OperatorPackage {
    pub fn from_code(code: &GeneratedCode) -> Self {
        let mut dependencies = code.dependencies.clone();
        dependencies.sort();
        dependencies.dedup();
        Self {
            entrypoint: code.entrypoint.clone(),
            kind: code.kind,
            signature: code
                .signature
                .clone()
                .unwrap_or_else(|| code.kind.expected_signature().to_string()),
            source: code.source.clone(),
            dependencies,
        }
    }

    /// Content digest over the canonical package; also its version.
    pub fn digest(&self) -> Result<Digest, mrp_core::Error> {
        hash_canonical(self)
    }

    /// Declared kind and entrypoint signature must match the phase contract.
    pub fn check_capability(&self, phase: OperatorKind) -> Result<(), String> {
        if self.kind != phase {
            return Err(format!(
                "generated operator `{}` declares kind `{}` but is used in the {} phase",
                self.entrypoint, self.kind, phase
            ));
        }
        let expected = phase.expected_signature();
        if normalize_signature(&self.signature) != normalize_signature(expected) {
            return Err(format!(
                "generated operator `{}` declares signature `{}`, {} requires `{}`",
                self.entrypoint, self.signature, phase, expected
            ));
        }
        if self.entrypoint.trim().is_empty() {
            return Err("generated operator has an empty entrypoint".into());
        }
        Ok(())
    }
}

fn normalize_signature(sig: &str) -> String {
    sig.chars().filter(|c| !c.is_whitespace()).collect()
}

/// One invocation of a package entrypoint.
#[derive(Debug)]
pub enum PackageCall<'a> {
    Map {
        params: &'a Value,
    },
    Reduce {
        inputs: &'a [Value],
        config: &'a Value,
    },
    Produce {
        result: &'a Value,
        config: &'a Value,
        ctx: &'a ProduceContext,
    },
}

/// Executes generated packages in-process.
pub trait PackageRunner: Send + Sync + 'static {
    fn invoke(
        &self,
        package: &OperatorPackage,
        call: PackageCall<'_>,
        seed: &Seed,
    ) -> Result<Value, OpError>;
}

/// Default runner: refuses to execute anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedRunner;

impl PackageRunner for UnsupportedRunner {
    fn invoke(
        &self,
        package: &OperatorPackage,
        _call: PackageCall<'_>,
        _seed: &Seed,
    ) -> Result<Value, OpError> {
        Err(OpError::Exec(format!(
            "no package runner configured for generated operator `{}`",
            package.entrypoint
        )))
    }
}

/// A stored package bound to a runner, usable wherever a registered operator is.
pub struct GeneratedOperator {
    package: Arc<OperatorPackage>,
    version: String,
    runner: Arc<dyn PackageRunner>,
}

impl GeneratedOperator {
    pub fn new(package: OperatorPackage, digest: Digest, runner: Arc<dyn PackageRunner>) -> Self {
        Self {
            package: Arc::new(package),
            version: digest.to_hex(),
            runner,
        }
    }

    pub fn package(&self) -> &OperatorPackage {
        &self.package
    }
}

impl MapOperator for GeneratedOperator {
    fn name(&self) -> &str {
        &self.package.entrypoint
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn run(&self, params: &Value, seed: &Seed) -> Result<Value, OpError> {
        self.runner
            .invoke(&self.package, PackageCall::Map { params }, seed)
    }
}

impl ReduceOperator for GeneratedOperator {
    fn name(&self) -> &str {
        &self.package.entrypoint
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn run(&self, inputs: &[Value], config: &Value, seed: &Seed) -> Result<Value, OpError> {
        self.runner
            .invoke(&self.package, PackageCall::Reduce { inputs, config }, seed)
    }
}

impl ProduceOperator for GeneratedOperator {
    fn name(&self) -> &str {
        &self.package.entrypoint
    }
    fn version(&self) -> &str {
        &self.version
    }
    fn sink(&self, config: &Value) -> SinkContract {
        SinkContract {
            destination: config
                .get("destination")
                .and_then(Value::as_str)
                .unwrap_or(".")
                .to_string(),
            schema_ref: format!("generated:{}", self.version),
        }
    }
    fn run(
        &self,
        result: &Value,
        config: &Value,
        ctx: &ProduceContext,
        seed: &Seed,
    ) -> Result<Value, OpError> {
        self.runner.invoke(
            &self.package,
            PackageCall::Produce {
                result,
                config,
                ctx,
            },
            seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(kind: OperatorKind, signature: Option<&str>) -> GeneratedCode {
        GeneratedCode {
            entrypoint: "Agent".into(),
            kind,
            signature: signature.map(str::to_string),
            source: "class Agent: ...".into(),
            dependencies: vec!["numpy".into(), "attrs".into(), "numpy".into()],
        }
    }

    #[test]
    fn dependencies_are_sorted_and_deduped() {
        let pkg = OperatorPackage::from_code(&code(OperatorKind::Map, None));
        assert_eq!(pkg.dependencies, vec!["attrs".to_string(), "numpy".to_string()]);
        assert_eq!(pkg.signature, "run(params, seed)");
    }

    #[test]
    fn capability_must_match_phase() {
        let pkg = OperatorPackage::from_code(&code(OperatorKind::Produce, None));
        assert!(pkg.check_capability(OperatorKind::Produce).is_ok());
        let err = pkg.check_capability(OperatorKind::Map).unwrap_err();
        assert!(err.contains("produce"), "{err}");
    }

    #[test]
    fn signature_mismatch_is_rejected() {
        let pkg = OperatorPackage::from_code(&code(OperatorKind::Reduce, Some("run(x)")));
        assert!(pkg.check_capability(OperatorKind::Reduce).is_err());
        let ok = OperatorPackage::from_code(&code(OperatorKind::Reduce, Some("run( inputs,seed )")));
        assert!(ok.check_capability(OperatorKind::Reduce).is_ok());
    }

    #[test]
    fn digest_tracks_source() {
        let a = OperatorPackage::from_code(&code(OperatorKind::Map, None));
        let mut b = a.clone();
        b.source.push('\n');
        assert_ne!(a.digest().unwrap(), b.digest().unwrap());
        assert_eq!(a.digest().unwrap(), a.clone().digest().unwrap());
    }

    #[test]
    fn unsupported_runner_fails_permanently() {
        let pkg = OperatorPackage::from_code(&code(OperatorKind::Map, None));
        let digest = pkg.digest().unwrap();
        let op = GeneratedOperator::new(pkg, digest, Arc::new(UnsupportedRunner));
        let seed = Seed(digest);
        let err = MapOperator::run(&op, &serde_json::json!({}), &seed).unwrap_err();
        assert!(!err.is_retryable());
    }
}
