use mrp_core::hash::Digest;
use thiserror::Error;

/// Result type local to mrp-store.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(Digest),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("checksum mismatch: expected {expected}, stored bytes hash to {actual}")]
    ChecksumMismatch { expected: Digest, actual: Digest },

    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl From<mrp_core::Error> for StoreError {
    fn from(e: mrp_core::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}
