#![forbid(unsafe_code)]
//! mrp-store: content-addressed artifact store.
//!
//! `ArtifactStore` sits on top of a small `Storage` trait with two adapters:
//! a rooted filesystem store (atomic write-rename) and an in-memory map used
//! by tests and `memory://` URIs. Digests are BLAKE3 over the stored bytes, so
//! a digest already present is never rewritten.

pub mod artifact;
pub mod error;
pub mod storage;

pub use artifact::{Artifact, ArtifactStore, ContentType};
pub use error::{Result, StoreError};
pub use storage::{build_storage_from_config, FsStorage, MemoryStorage, Storage};
