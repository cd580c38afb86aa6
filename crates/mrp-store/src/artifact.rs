//! Content-addressed artifacts.
//!
//! Layout inside the backing storage:
//!
//! - `objects/<hex>`: the stored bytes (canonical JSON or raw bytes)
//! - `types/<hex>`: content-type sidecar
//! - `refs/<namespace>/<name>`: named pointer to a digest (shard memo, run index)

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mrp_core::canonical::canonical_bytes;
use mrp_core::config::StoreConfig;
use mrp_core::hash::{hash_bytes, Digest};

use crate::error::{Result, StoreError};
use crate::storage::{build_storage_from_config, MemoryStorage, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/octet-stream")]
    Binary,
    #[serde(rename = "text/plain")]
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Binary => "application/octet-stream",
            ContentType::Text => "text/plain",
        }
    }

    fn parse(s: &str) -> Self {
        match s.trim() {
            "application/json" => ContentType::Json,
            "text/plain" => ContentType::Text,
            _ => ContentType::Binary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub digest: Digest,
    pub payload: Vec<u8>,
    pub content_type: ContentType,
}

impl Artifact {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Digest-addressed store over any `Storage` backend. Cheap to clone.
#[derive(Clone)]
pub struct ArtifactStore {
    storage: Arc<dyn Storage>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore").finish_non_exhaustive()
    }
}

fn object_key(d: &Digest) -> String {
    format!("objects/{}", d.to_hex())
}

fn type_key(d: &Digest) -> String {
    format!("types/{}", d.to_hex())
}

fn ref_key(namespace: &str, name: &str) -> String {
    format!("refs/{namespace}/{name}")
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Open the store described by an engine `StoreConfig`.
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        Ok(Self::new(build_storage_from_config(cfg)?))
    }

    /// Store a serializable value as canonical JSON and return its digest.
    pub fn put_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Digest> {
        let bytes = canonical_bytes(value)?;
        self.put_bytes(&bytes, ContentType::Json)
    }

    /// Store raw bytes. If the digest is already present nothing is written.
    pub fn put_bytes(&self, bytes: &[u8], content_type: ContentType) -> Result<Digest> {
        let digest = hash_bytes(bytes);
        let key = object_key(&digest);
        if self.storage.exists(&key)? {
            return Ok(digest);
        }
        // Sidecar first: a visible object always has its type.
        self.storage
            .write(&type_key(&digest), content_type.as_str().as_bytes())?;
        self.storage.write(&key, bytes)?;
        Ok(digest)
    }

    pub fn has(&self, digest: &Digest) -> Result<bool> {
        self.storage.exists(&object_key(digest))
    }

    pub fn get(&self, digest: &Digest) -> Result<Artifact> {
        let payload = self
            .storage
            .read(&object_key(digest))?
            .ok_or(StoreError::NotFound(*digest))?;
        let content_type = self
            .storage
            .read(&type_key(digest))?
            .map(|b| ContentType::parse(&String::from_utf8_lossy(&b)))
            .unwrap_or(ContentType::Binary);
        Ok(Artifact {
            digest: *digest,
            payload,
            content_type,
        })
    }

    /// Fetch and re-hash; fails with `ChecksumMismatch` on corrupted bytes.
    pub fn get_verified(&self, digest: &Digest) -> Result<Artifact> {
        let artifact = self.get(digest)?;
        let actual = hash_bytes(&artifact.payload);
        if actual != *digest {
            return Err(StoreError::ChecksumMismatch {
                expected: *digest,
                actual,
            });
        }
        Ok(artifact)
    }

    pub fn get_json<T: DeserializeOwned>(&self, digest: &Digest) -> Result<T> {
        self.get(digest)?.json()
    }

    pub fn get_value(&self, digest: &Digest) -> Result<Value> {
        self.get_json(digest)
    }

    /// Point `namespace/name` at a digest. Overwrites any previous target.
    pub fn set_ref(&self, namespace: &str, name: &str, target: &Digest) -> Result<()> {
        self.storage
            .write(&ref_key(namespace, name), target.to_hex().as_bytes())
    }

    pub fn get_ref(&self, namespace: &str, name: &str) -> Result<Option<Digest>> {
        match self.storage.read(&ref_key(namespace, name))? {
            Some(bytes) => {
                let hex = String::from_utf8_lossy(&bytes);
                Ok(Some(Digest::from_hex(&hex)?))
            }
            None => Ok(None),
        }
    }
}
