//! Storage adapters behind the artifact store.
//!
//! - `fs`: directory-rooted local filesystem (default).
//! - `memory`: process-local map for tests and `memory://`.
//!
//! Keys are relative, `/`-separated paths such as `objects/<hex>`.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use mrp_core::config::StoreConfig;

use crate::error::{Result, StoreError};

/// Byte-level storage interface.
pub trait Storage: Send + Sync {
    /// Write bytes under a key, replacing any previous value atomically.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Read the full value; `Ok(None)` when the key is absent.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Idempotent: deleting an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Build the storage backend named by the configured URI scheme.
pub fn build_storage_from_config(cfg: &StoreConfig) -> Result<Arc<dyn Storage>> {
    match cfg.scheme() {
        Some("memory") | Some("mem") => Ok(Arc::new(MemoryStorage::new())),
        Some("file") | None => Ok(Arc::new(FsStorage::new(&cfg.root))),
        Some(other) => Err(StoreError::Config(format!(
            "unsupported store scheme '{other}' (expected file:// or memory://)"
        ))),
    }
}

/// Reject keys that could escape the store root.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StoreError::Storage(format!("invalid key {key:?}")));
    }
    if key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(StoreError::Storage(format!("invalid key {key:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_scheme_builds_memory_storage() {
        let cfg = StoreConfig {
            uri: Some("memory://".into()),
            root: "memory:".into(),
        };
        let storage = build_storage_from_config(&cfg).unwrap();
        storage.write("a/b", b"x").unwrap();
        assert_eq!(storage.read("a/b").unwrap().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let cfg = StoreConfig {
            uri: Some("s3://bucket/prefix".into()),
            root: "s3://bucket/prefix".into(),
        };
        let err = build_storage_from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("s3"));
    }

    #[test]
    fn keys_cannot_escape_root() {
        assert!(check_key("objects/abc").is_ok());
        assert!(check_key("../etc/passwd").is_err());
        assert!(check_key("/abs").is_err());
        assert!(check_key("a//b").is_err());
    }
}
