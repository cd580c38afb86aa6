//! In-memory storage backend.
//!
//! Backs the `memory://` scheme and unit tests that should not touch disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{check_key, Storage};
use crate::error::Result;

/// Thread-safe in-memory storage. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // Values are whole byte strings; a panic elsewhere cannot leave one half-written.
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        check_key(key)?;
        self.data().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        check_key(key)?;
        Ok(self.data().get(key).cloned())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        Ok(self.data().contains_key(key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.data().remove(key);
        Ok(())
    }
}
