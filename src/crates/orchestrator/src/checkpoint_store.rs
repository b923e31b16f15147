//! SQLite-backed checkpoint store
//!
//! Implements `pipeline_checkpoint::CheckpointStore` over the append-only
//! `pipeline_debug_logs` table. Checkpoints are written with direction
//! `state_after`; the render dispatcher logs payloads into the same table
//! with direction `input`.

use crate::db::connection::DatabasePool;
use crate::db::models::DebugLogRow;
use crate::db::repositories::DebugLogRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_checkpoint::{CheckpointError, CheckpointStore, StepCheckpoint};

/// Direction tag used for state checkpoints
pub const CHECKPOINT_DIRECTION: &str = "state_after";

/// Checkpoint store persisting to `pipeline_debug_logs`
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    fn row_to_checkpoint(row: DebugLogRow) -> pipeline_checkpoint::Result<StepCheckpoint> {
        let envelope: serde_json::Value = serde_json::from_str(&row.payload)?;
        let state = envelope
            .get("state")
            .cloned()
            .ok_or_else(|| CheckpointError::Invalid(format!("row {} has no state", row.id)))?;
        let created_at = DateTime::parse_from_rfc3339(&row.created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(StepCheckpoint {
            job_id: row.job_id,
            step_name: row.step_name,
            state,
            duration_ms: envelope
                .get("duration_ms")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0),
            attempt: envelope
                .get("attempt")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(1) as u32,
            created_at,
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn put(&self, checkpoint: StepCheckpoint) -> pipeline_checkpoint::Result<()> {
        let payload = serde_json::to_string(&serde_json::json!({
            "state": checkpoint.state,
            "duration_ms": checkpoint.duration_ms,
            "attempt": checkpoint.attempt,
        }))?;

        DebugLogRepository::insert(
            &self.pool,
            &checkpoint.job_id,
            &checkpoint.step_name,
            CHECKPOINT_DIRECTION,
            &payload,
        )
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))
    }

    async fn get(
        &self,
        job_id: &str,
        step_name: &str,
    ) -> pipeline_checkpoint::Result<Option<StepCheckpoint>> {
        let row = DebugLogRepository::latest(&self.pool, job_id, step_name, CHECKPOINT_DIRECTION)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        row.map(Self::row_to_checkpoint).transpose()
    }

    async fn list(&self, job_id: &str) -> pipeline_checkpoint::Result<Vec<StepCheckpoint>> {
        let rows = DebugLogRepository::list_by_job(&self.pool, job_id, CHECKPOINT_DIRECTION)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        rows.into_iter().map(Self::row_to_checkpoint).collect()
    }

    async fn delete_job(&self, job_id: &str) -> pipeline_checkpoint::Result<()> {
        DebugLogRepository::delete_by_job(&self.pool, job_id)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))
    }
}
