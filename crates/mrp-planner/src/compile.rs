//! Compiler: normalized spec + registry → IR, manifest, policy report.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use mrp_core::config::EngineConfig;
use mrp_core::hash::{hash_canonical, Digest};
use mrp_core::ir::{
    Ir, Manifest, MapTask, OperatorIdentity, OperatorSet, OperatorSource, ProduceTask, ReduceTask,
    Seed,
};
use mrp_core::policy::PolicyReport;
use mrp_core::spec::{ExecutionBackend, JobSpec, OperatorKind, OperatorRef};
use mrp_operators::{OperatorPackage, OperatorRegistry};

use crate::error::CompileError;
use crate::normalize::{normalize_document, normalize_str};
use crate::policy::{PolicyEngine, PolicyRequest};
use crate::seed::derive_seed;

/// Compiler output. Serializes as `{ir, manifest, policy}`.
#[derive(Debug, Clone, Serialize)]
pub struct Compiled {
    pub ir: Ir,
    pub manifest: Manifest,
    pub policy: PolicyReport,
    /// Generated-code packages referenced by the manifest, keyed by digest.
    #[serde(skip)]
    pub packages: Vec<(Digest, OperatorPackage)>,
}

impl Compiled {
    pub fn ir_digest(&self) -> Result<Digest, CompileError> {
        Ok(hash_canonical(&self.ir)?)
    }

    pub fn manifest_digest(&self) -> Result<Digest, CompileError> {
        Ok(hash_canonical(&self.manifest)?)
    }
}

#[derive(Serialize)]
struct TaskKeyMaterial<'a> {
    operator: Digest,
    params: &'a Value,
    seed: Seed,
}

/// Cache key of one Map task: (operator digest, params, seed).
pub fn task_key(operator: &Digest, params: &Value, seed: &Seed) -> Result<Digest, CompileError> {
    Ok(hash_canonical(&TaskKeyMaterial {
        operator: *operator,
        params,
        seed: *seed,
    })?)
}

pub struct Compiler {
    registry: Arc<OperatorRegistry>,
    policy: PolicyEngine,
}

impl Compiler {
    pub fn new(registry: Arc<OperatorRegistry>, cfg: &EngineConfig) -> Self {
        Self {
            registry,
            policy: PolicyEngine::new(cfg),
        }
    }

    pub fn registry(&self) -> &Arc<OperatorRegistry> {
        &self.registry
    }

    pub fn compile_str(&self, src: &str) -> Result<Compiled, CompileError> {
        self.compile(&normalize_str(src)?)
    }

    pub fn compile_document(&self, doc: &Value) -> Result<Compiled, CompileError> {
        self.compile(&normalize_document(doc)?)
    }

    pub fn compile(&self, spec: &JobSpec) -> Result<Compiled, CompileError> {
        let mut packages = Vec::new();
        let operators = OperatorSet {
            map: self.resolve(spec, OperatorKind::Map, &spec.map.operator, &mut packages)?,
            reduce: self.resolve(spec, OperatorKind::Reduce, &spec.reduce.operator, &mut packages)?,
            produce: self.resolve(
                spec,
                OperatorKind::Produce,
                &spec.produce.operator,
                &mut packages,
            )?,
        };

        let seed = derive_seed(spec, &operators)?;

        let maps = spec
            .map
            .shards
            .iter()
            .map(|shard| {
                Ok(MapTask {
                    shard_id: shard.id,
                    operator: operators.map.reference.clone(),
                    params: shard.payload.clone(),
                    task_key: task_key(&operators.map.digest, &shard.payload, &seed)?,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;

        let policy = self
            .policy
            .enforce(&PolicyRequest::from_spec(spec, &operators))?;

        let ir = Ir {
            job_id: spec.job_id.clone(),
            backend: spec.execution_backend,
            maps,
            map_cache: spec.map.cache,
            reduce: ReduceTask {
                operator: operators.reduce.reference.clone(),
                config: spec.reduce.config.clone(),
            },
            produce: ProduceTask {
                operator: operators.produce.reference.clone(),
                config: spec.produce.config.clone(),
            },
            seed,
            sandbox_profile_ref: spec.sandbox_profile_ref.clone(),
            resources: spec.resources.clone(),
            egress: spec.egress.clone(),
        };
        let manifest = Manifest {
            job_id: spec.job_id.clone(),
            spec_version: spec.version.clone(),
            operators,
            seed,
            engine_version: mrp_core::VERSION.to_string(),
        };

        info!(
            job_id = %spec.job_id,
            shards = ir.maps.len(),
            backend = %ir.backend,
            seed = %seed.0.short(),
            "compiled job"
        );
        Ok(Compiled {
            ir,
            manifest,
            policy,
            packages,
        })
    }

    fn resolve(
        &self,
        spec: &JobSpec,
        phase: OperatorKind,
        op: &OperatorRef,
        packages: &mut Vec<(Digest, OperatorPackage)>,
    ) -> Result<OperatorIdentity, CompileError> {
        let sandbox_note = if spec.execution_backend == ExecutionBackend::SandboxedRemote {
            " (sandboxed_remote requires phase-matching operators)"
        } else {
            ""
        };

        match op {
            OperatorRef::Registered { name, version } => {
                let entry = self
                    .registry
                    .resolve(name, version.as_deref())
                    .map_err(|e| CompileError::UnresolvedOperator {
                        phase,
                        reference: op.label(),
                        reason: e.to_string(),
                    })?;
                if entry.meta.kind != phase {
                    return Err(CompileError::IrConstraint(format!(
                        "operator `{}` is a {} operator and cannot be used in the {} phase{}",
                        entry.meta.reference(),
                        entry.meta.kind,
                        phase,
                        sandbox_note
                    )));
                }
                debug!(%phase, operator = %entry.meta.reference(), "resolved registered operator");
                Ok(OperatorIdentity {
                    reference: entry.meta.reference(),
                    name: entry.meta.name.clone(),
                    kind: entry.meta.kind,
                    version: entry.meta.version.clone(),
                    digest: entry.digest,
                    source: OperatorSource::Registered,
                })
            }
            OperatorRef::Generated(code) => {
                let package = OperatorPackage::from_code(code);
                package
                    .check_capability(phase)
                    .map_err(|reason| CompileError::IrConstraint(format!("{reason}{sandbox_note}")))?;
                let digest = package.digest()?;
                let version = digest.to_hex();
                debug!(%phase, entrypoint = %package.entrypoint, package = %digest.short(), "materialized generated operator");
                let identity = OperatorIdentity {
                    reference: format!("{}@{}", package.entrypoint, version),
                    name: package.entrypoint.clone(),
                    kind: phase,
                    version,
                    digest,
                    source: OperatorSource::Generated {
                        package: digest,
                        entrypoint: package.entrypoint.clone(),
                    },
                };
                if !packages.iter().any(|(d, _)| *d == digest) {
                    packages.push((digest, package));
                }
                Ok(identity)
            }
        }
    }
}
