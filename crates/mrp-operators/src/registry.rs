//! Versioned operator registry.
//!
//! Built once through `RegistryBuilder`, then frozen and shared behind an
//! `Arc`. The compiler resolves references against it and the runtime looks
//! up the same entries by `name@version`, so both sides agree on what runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use mrp_core::hash::{hash_canonical, Digest};
use mrp_core::spec::OperatorKind;
use thiserror::Error;

use crate::builtin;
use crate::traits::{MapOperator, OperatorMeta, ProduceOperator, ReduceOperator};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate operator registration `{0}`")]
    Duplicate(String),

    #[error("operator `{0}` is not registered")]
    Unknown(String),

    #[error("operator `{name}` has no version `{version}`")]
    UnknownVersion { name: String, version: String },

    #[error("hashing operator identity: {0}")]
    Hash(#[from] mrp_core::Error),
}

/// A registered implementation of one phase contract.
#[derive(Clone)]
pub enum OperatorHandle {
    Map(Arc<dyn MapOperator>),
    Reduce(Arc<dyn ReduceOperator>),
    Produce(Arc<dyn ProduceOperator>),
}

impl OperatorHandle {
    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorHandle::Map(_) => OperatorKind::Map,
            OperatorHandle::Reduce(_) => OperatorKind::Reduce,
            OperatorHandle::Produce(_) => OperatorKind::Produce,
        }
    }

    fn meta(&self) -> OperatorMeta {
        let (name, version) = match self {
            OperatorHandle::Map(op) => (op.name(), op.version()),
            OperatorHandle::Reduce(op) => (op.name(), op.version()),
            OperatorHandle::Produce(op) => (op.name(), op.version()),
        };
        OperatorMeta::new(name, version, self.kind())
    }
}

impl std::fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperatorHandle({})", self.meta().reference())
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredOperator {
    pub meta: OperatorMeta,
    /// Digest of the identity triple; stands in for a code digest.
    pub digest: Digest,
    pub handle: OperatorHandle,
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<OperatorHandle>,
}

impl RegistryBuilder {
    pub fn map(mut self, op: impl MapOperator) -> Self {
        self.entries.push(OperatorHandle::Map(Arc::new(op)));
        self
    }

    pub fn reduce(mut self, op: impl ReduceOperator) -> Self {
        self.entries.push(OperatorHandle::Reduce(Arc::new(op)));
        self
    }

    pub fn produce(mut self, op: impl ProduceOperator) -> Self {
        self.entries.push(OperatorHandle::Produce(Arc::new(op)));
        self
    }

    pub fn handle(mut self, handle: OperatorHandle) -> Self {
        self.entries.push(handle);
        self
    }

    /// Freeze the registry. Two registrations of the same `name@version` fail.
    pub fn build(self) -> Result<OperatorRegistry, RegistryError> {
        let mut by_name: BTreeMap<String, BTreeMap<String, RegisteredOperator>> = BTreeMap::new();
        for handle in self.entries {
            let meta = handle.meta();
            let digest = hash_canonical(&meta)?;
            let versions = by_name.entry(meta.name.clone()).or_default();
            if versions.contains_key(&meta.version) {
                return Err(RegistryError::Duplicate(meta.reference()));
            }
            versions.insert(
                meta.version.clone(),
                RegisteredOperator {
                    meta,
                    digest,
                    handle,
                },
            );
        }
        let fingerprint_src: Vec<(&String, &Digest)> = by_name
            .values()
            .flat_map(|vs| vs.values())
            .map(|r| (&r.meta.name, &r.digest))
            .collect();
        let fingerprint = hash_canonical(&fingerprint_src)?;
        Ok(OperatorRegistry {
            by_name,
            fingerprint,
        })
    }
}

/// Immutable operator registry.
#[derive(Debug)]
pub struct OperatorRegistry {
    by_name: BTreeMap<String, BTreeMap<String, RegisteredOperator>>,
    fingerprint: Digest,
}

impl OperatorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry preloaded with the reference operators.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        builtin::register(Self::builder()).build()
    }

    /// Digest over every registered identity; changes when the registry does.
    pub fn fingerprint(&self) -> Digest {
        self.fingerprint
    }

    /// Resolve `name` at `version`, or the highest version when unpinned.
    pub fn resolve(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<&RegisteredOperator, RegistryError> {
        let versions = self
            .by_name
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        match version {
            Some(v) => versions
                .get(v)
                .ok_or_else(|| RegistryError::UnknownVersion {
                    name: name.to_string(),
                    version: v.to_string(),
                }),
            None => versions
                .values()
                .max_by(|a, b| version_key(&a.meta.version).cmp(&version_key(&b.meta.version)))
                .ok_or_else(|| RegistryError::Unknown(name.to_string())),
        }
    }

    /// Look up an exact `name@version` reference.
    pub fn get(&self, reference: &str) -> Option<&RegisteredOperator> {
        let (name, version) = reference.rsplit_once('@')?;
        self.by_name.get(name)?.get(version)
    }

    pub fn map_operator(&self, reference: &str) -> Option<Arc<dyn MapOperator>> {
        match &self.get(reference)?.handle {
            OperatorHandle::Map(op) => Some(Arc::clone(op)),
            _ => None,
        }
    }

    pub fn reduce_operator(&self, reference: &str) -> Option<Arc<dyn ReduceOperator>> {
        match &self.get(reference)?.handle {
            OperatorHandle::Reduce(op) => Some(Arc::clone(op)),
            _ => None,
        }
    }

    pub fn produce_operator(&self, reference: &str) -> Option<Arc<dyn ProduceOperator>> {
        match &self.get(reference)?.handle {
            OperatorHandle::Produce(op) => Some(Arc::clone(op)),
            _ => None,
        }
    }

    /// All entries in (name, version) order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisteredOperator> {
        self.by_name.values().flat_map(|vs| vs.values())
    }
}

/// Numeric-aware ordering for dotted versions (`1.10.0` > `1.9.0`).
fn version_key(v: &str) -> Vec<(u64, String)> {
    v.split(['.', '-'])
        .map(|part| match part.parse::<u64>() {
            Ok(n) => (n, String::new()),
            Err(_) => (0, part.to_string()),
        })
        .collect()
}
