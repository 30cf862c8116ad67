//! In-memory fakes for storage traits (testing and dry runs)
//!
//! `MemoryStateStore` satisfies the `StateStore` contract without touching
//! the filesystem. It can also be told to fail saves, which lets callers
//! exercise their persistence-error handling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

/// In-memory state store backed by a `Mutex<Option<DeploymentState>>`.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<DeploymentState>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an already-persisted state.
    pub fn with_state(state: DeploymentState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Self::default()
        }
    }

    /// Make every subsequent `save` fail with a storage error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Snapshot of the currently persisted state.
    pub fn snapshot(&self) -> Option<DeploymentState> {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> StorageResult<Option<DeploymentState>> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save(&self, state: &DeploymentState) -> StorageResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Task("injected save failure".to_string()));
        }
        *self.state.lock().unwrap() = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        *self.state.lock().unwrap() = None;
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
