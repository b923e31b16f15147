//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointStore`] is the reference implementation of
//! [`CheckpointStore`]: a thread-safe map from job id to its chronological
//! checkpoint history. Data is lost on restart; use the orchestrator's
//! SQLite-backed store for anything that must survive a process.

use crate::{checkpoint::StepCheckpoint, error::Result, traits::CheckpointStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe in-memory checkpoint store.
///
/// Cloning is cheap; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    entries: Arc<RwLock<HashMap<String, Vec<StepCheckpoint>>>>,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all checkpoints (test isolation)
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Total number of stored checkpoints across all jobs
    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    /// Whether the store holds no checkpoints
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, checkpoint: StepCheckpoint) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries
            .entry(checkpoint.job_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn get(&self, job_id: &str, step_name: &str) -> Result<Option<StepCheckpoint>> {
        let entries = self.entries.read().await;
        Ok(entries.get(job_id).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|cp| cp.step_name == step_name)
                .cloned()
        }))
    }

    async fn list(&self, job_id: &str) -> Result<Vec<StepCheckpoint>> {
        let entries = self.entries.read().await;
        Ok(entries.get(job_id).cloned().unwrap_or_default())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.entries.write().await.remove(job_id);
        Ok(())
    }
}
