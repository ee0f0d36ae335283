#![forbid(unsafe_code)]
//! MonoFS public API facade.
//!
//! Re-exports the engine from `mfs-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI, host
//! tooling) depend on.

pub use mfs_core::*;
