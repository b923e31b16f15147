//! Debug log row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of the append-only `pipeline_debug_logs` table.
///
/// Checkpoints use direction `state_after`; render dispatch payloads are
/// captured with direction `input`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DebugLogRow {
    pub id: i64,
    pub job_id: String,
    pub step_name: String,
    pub direction: String,
    /// JSON payload as text
    pub payload: String,
    /// RFC3339 timestamp
    pub created_at: String,
}
