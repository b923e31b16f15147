//! Checkpoint storage trait for custom backend implementations
//!
//! [`CheckpointStore`] is the seam between the pipeline engine and whatever
//! durable log backs it (SQLite, Postgres, an in-memory map for tests).
//! Implementations must be `Send + Sync`; every job's entries form an
//! append-only history ordered by `created_at`.

use crate::{checkpoint::StepCheckpoint, error::Result};
use async_trait::async_trait;

/// Storage backend for step checkpoints.
///
/// The engine calls [`put`](Self::put) after every successful step and after
/// every async-output merge. The replay engine reads single entries back via
/// [`get`](Self::get) and walks history via [`list`](Self::list).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint to the job's history.
    async fn put(&self, checkpoint: StepCheckpoint) -> Result<()>;

    /// Latest checkpoint recorded for `step_name` within a job, if any.
    ///
    /// When a step ran more than once (replay re-executions append new
    /// entries), the most recent snapshot wins.
    async fn get(&self, job_id: &str, step_name: &str) -> Result<Option<StepCheckpoint>>;

    /// All checkpoints for a job in chronological order.
    async fn list(&self, job_id: &str) -> Result<Vec<StepCheckpoint>>;

    /// Delete every checkpoint belonging to a job.
    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let _ = job_id;
        Ok(())
    }
}
