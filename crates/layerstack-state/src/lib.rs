//! Layerstack-State: deployment state persistence
//!
//! This crate owns the last-known set of layer outputs across runs so a
//! deployment can be resumed idempotently.
//!
//! ## Key Components
//!
//! - `StateStore`: backend-agnostic read/modify/write contract
//! - `FileStateStore`: JSON file backend with atomic replace
//! - `MemoryStateStore`: in-memory backend for tests and dry runs
//!
//! ## Single writer
//!
//! Every backend assumes exactly one orchestrator process writes a given
//! state location at a time. No locking is performed; two concurrent runs
//! against the same state file will overwrite each other's results.

mod error;
pub mod fakes;
pub mod file;
pub mod storage_traits;

pub use error::StorageError;
pub use fakes::MemoryStateStore;
pub use file::FileStateStore;
pub use storage_traits::{
    DeploymentState, LayerOutput, StateStore, StorageResult, STATE_VERSION,
};
