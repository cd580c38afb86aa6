#![forbid(unsafe_code)]
//! mrp-operators: operator contracts and the registry the compiler resolves against.
//!
//! - `traits`: the three phase contracts (`MapOperator`, `ReduceOperator`,
//!   `ProduceOperator`) and the operator error taxonomy.
//! - `registry`: immutable, versioned registry built once and injected.
//! - `package`: generated-code packages, their capability check, and the
//!   `PackageRunner` seam that executes them.
//! - `builtin`: small reference operators used by tests and demos.
//!
//! Operators are synchronous and must be deterministic for a given
//! (input, config, seed).

pub mod builtin;
pub mod package;
pub mod registry;
pub mod traits;

pub use package::{GeneratedOperator, OperatorPackage, PackageCall, PackageRunner, UnsupportedRunner};
pub use registry::{OperatorHandle, OperatorRegistry, RegisteredOperator, RegistryBuilder, RegistryError};
pub use traits::{
    MapOperator, OpError, OperatorMeta, ProduceContext, ProduceOperator, ReduceOperator,
    SinkContract,
};
