#![forbid(unsafe_code)]
//! mrp-core: shared data model for the Map/Reduce/Produce pipeline.
//!
//! Everything here is pure data plus deterministic hashing. The planner
//! produces these types, the exec crate consumes and seals them, and the
//! store persists them by digest.

pub mod canonical;
pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod ir;
pub mod policy;
pub mod prelude;
pub mod record;
pub mod spec;

pub use error::{Error, Result};

/// Engine version string recorded for provenance.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
