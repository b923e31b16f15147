//! Checkpoint data structure

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A snapshot of the full pipeline state captured after one step.
///
/// `step_name` is the step that produced the snapshot. Synthetic entries
/// named `await_<step>` record the state right after an async step's
/// outputs were merged into the main sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCheckpoint {
    /// Job the snapshot belongs to
    pub job_id: String,

    /// Step that produced the snapshot (or `await_<step>` for merges)
    pub step_name: String,

    /// Full pipeline state as JSON
    pub state: Value,

    /// Wall-clock duration of the step execution
    pub duration_ms: i64,

    /// Attempt number that succeeded (1-based)
    pub attempt: u32,

    /// Capture timestamp
    pub created_at: DateTime<Utc>,
}

impl StepCheckpoint {
    /// Create a checkpoint stamped with the current time
    pub fn new(
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        state: Value,
        duration_ms: i64,
        attempt: u32,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            step_name: step_name.into(),
            state,
            duration_ms,
            attempt,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_new_stamps_time() {
        let cp = StepCheckpoint::new("job-1", "transcribe", json!({"a": 1}), 1200, 1);
        assert_eq!(cp.job_id, "job-1");
        assert_eq!(cp.step_name, "transcribe");
        assert_eq!(cp.attempt, 1);
        assert!(cp.created_at <= Utc::now());
    }

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let cp = StepCheckpoint::new("job-1", "render", json!({"x": [1, 2]}), 0, 2);
        let text = serde_json::to_string(&cp).unwrap();
        let back: StepCheckpoint = serde_json::from_str(&text).unwrap();
        assert_eq!(back.step_name, "render");
        assert_eq!(back.state, cp.state);
        assert_eq!(back.attempt, 2);
    }
}
