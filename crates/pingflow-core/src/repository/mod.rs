//! Repository trait definitions (ports) and in-memory implementations.
//!
//! These traits define the storage interface that the infrastructure layer
//! (pingflow-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod directory;
pub mod memory;
pub mod memory_directory;
pub mod run_store;
