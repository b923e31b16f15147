//! State manager - persists and loads pipeline state
//!
//! Source of truth is the `pipeline_state` JSON column on `video_jobs`.
//! Legacy scalar columns are written in the same transaction for code that
//! has not migrated yet, with coalescing semantics: a legacy column is only
//! touched when the new value is non-null, so a partial state never erases
//! data written by an earlier step.

use crate::db::connection::DatabasePool;
use crate::db::models::VideoJobRow;
use async_trait::async_trait;
use pipeline_core::{EngineError, JobStatus, PipelineState, StateStore};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Manages persistence of [`PipelineState`] rows
#[derive(Clone)]
pub struct StateManager {
    pool: DatabasePool,
}

/// A legacy-column value ready to bind
enum LegacyValue {
    Text(String),
    Int(i64),
}

impl StateManager {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Insert a fresh job row from an initial state (job intake boundary).
    pub async fn create_job(&self, state: &PipelineState) -> crate::Result<()> {
        let state_json = serde_json::to_string(state)?;
        sqlx::query(
            "INSERT INTO video_jobs
             (job_id, project_id, user_id, conversation_id, status, pipeline_state,
              videos, options, webhook_url, created_at)
             VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?)",
        )
        .bind(&state.job_id)
        .bind(&state.project_id)
        .bind(&state.user_id)
        .bind(&state.conversation_id)
        .bind(&state_json)
        .bind(serde_json::to_string(&state.videos)?)
        .bind(serde_json::to_string(&state.options)?)
        .bind(&state.webhook_url)
        .bind(
            state
                .created_at
                .clone()
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Curated legacy projection: only non-null values are emitted.
    fn legacy_values(state: &PipelineState) -> Vec<(&'static str, LegacyValue)> {
        let mut values = Vec::new();

        let mut text = |col: &'static str, v: &Option<String>| {
            if let Some(s) = v {
                values.push((col, LegacyValue::Text(s.clone())));
            }
        };
        text("transcription_text", &state.transcription_text);
        text("phase1_video_url", &state.phase1_video_url);
        text("phase2_video_url", &state.phase2_video_url);
        text("output_video_url", &state.output_video_url);
        text("matted_video_url", &state.matted_video_url);
        text("base_normalized_url", &state.base_normalized_url);
        text("original_video_url", &state.original_video_url);
        text("phase1_audio_url", &state.phase1_audio_url);
        text("phase1_source", &state.phase1_source);
        text("error_message", &state.error_message);

        let mut json_col = |col: &'static str, v: &Option<Value>| {
            if let Some(value) = v {
                if let Ok(s) = serde_json::to_string(value) {
                    values.push((col, LegacyValue::Text(s)));
                }
            }
        };
        json_col("transcription_words", &state.transcription_words);
        json_col("phrase_groups", &state.phrase_groups);
        json_col("png_results", &state.png_results);
        json_col("shadow_results", &state.shadow_results);
        json_col("speech_segments", &state.speech_segments);
        json_col("cut_timestamps", &state.cut_timestamps);
        json_col("foreground_segments", &state.foreground_segments);
        json_col("matting_segments", &state.matting_segments);
        json_col("normalization_stats", &state.normalization_stats);
        json_col("untranscribed_segments", &state.untranscribed_segments);
        json_col("phase1_metadata", &state.phase1_metadata);

        if let Some(ms) = state.total_duration_ms {
            values.push(("total_duration_ms", LegacyValue::Int(ms)));
        }

        values
    }

    /// Derived `steps` array for external progress display: one entry per
    /// completed or failed step.
    fn build_steps_json(state: &PipelineState) -> Value {
        let mut steps: Vec<Value> = Vec::new();
        let mut names: Vec<&str> = state.completed_steps.iter().map(String::as_str).collect();
        if let Some(failed) = &state.failed_step {
            names.push(failed.as_str());
        }

        for name in names {
            let timing = state.step_timings.get(name).cloned().unwrap_or_default();
            let status = if state.failed_step.as_deref() == Some(name) {
                "failed"
            } else {
                "completed"
            };
            steps.push(json!({
                "name": name,
                "status": status,
                "started_at": timing.started_at,
                "duration_ms": timing.duration_ms,
                "error": timing.error,
            }));
        }
        Value::Array(steps)
    }

    /// Rebuild a state from the legacy scalar columns (migration path).
    fn reconstruct_from_legacy(row: &VideoJobRow) -> PipelineState {
        let parse = |v: &Option<String>| -> Option<Value> {
            v.as_deref().and_then(|s| serde_json::from_str(s).ok())
        };

        // Infer completed steps from the legacy steps array
        let mut completed = Vec::new();
        if let Some(Value::Array(entries)) = parse(&row.steps) {
            for entry in entries {
                if entry.get("status").and_then(Value::as_str) == Some("completed") {
                    if let Some(name) = entry.get("name").and_then(Value::as_str) {
                        completed.push(name.to_string());
                    }
                }
            }
        }

        let mut state = PipelineState::new(&row.job_id, &row.project_id, &row.user_id);
        state.conversation_id = row.conversation_id.clone();
        state.videos = parse(&row.videos)
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        state.options = parse(&row.options).unwrap_or_else(|| json!({}));
        state.webhook_url = row.webhook_url.clone();
        state.original_video_url = row.original_video_url.clone();
        state.normalized_video_url = row.base_normalized_url.clone();
        state.phase1_video_url = row.phase1_video_url.clone();
        state.phase1_audio_url = row.phase1_audio_url.clone();
        state.phase2_video_url = row.phase2_video_url.clone();
        state.output_video_url = row.output_video_url.clone();
        state.matted_video_url = row.matted_video_url.clone();
        state.base_normalized_url = row.base_normalized_url.clone();
        state.transcription_text = row.transcription_text.clone();
        state.transcription_words = parse(&row.transcription_words);
        state.phrase_groups = parse(&row.phrase_groups);
        state.png_results = parse(&row.png_results);
        state.shadow_results = parse(&row.shadow_results);
        state.speech_segments = parse(&row.speech_segments);
        state.cut_timestamps = parse(&row.cut_timestamps);
        state.foreground_segments = parse(&row.foreground_segments);
        state.matting_segments = parse(&row.matting_segments);
        state.normalization_stats = parse(&row.normalization_stats);
        state.untranscribed_segments = parse(&row.untranscribed_segments);
        state.phase1_source = row.phase1_source.clone();
        state.phase1_metadata = parse(&row.phase1_metadata);
        state.total_duration_ms = row.total_duration_ms;
        state.error_message = row.error_message.clone();
        state.completed_steps = completed;
        state.created_at = Some(row.created_at.clone());
        state
    }

    async fn fetch_row(&self, job_id: &str) -> Result<Option<VideoJobRow>, sqlx::Error> {
        sqlx::query_as::<_, VideoJobRow>("SELECT * FROM video_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
    }
}

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::StateStore(e.to_string())
}

#[async_trait]
impl StateStore for StateManager {
    async fn load(&self, job_id: &str) -> pipeline_core::Result<Option<PipelineState>> {
        let Some(row) = self.fetch_row(job_id).await.map_err(store_err)? else {
            return Ok(None);
        };

        if let Some(raw) = row.pipeline_state.as_deref().filter(|s| !s.is_empty()) {
            match serde_json::from_str::<Value>(raw).map(PipelineState::from_value) {
                Ok(Ok(state)) => {
                    info!(
                        job_id = %job_id,
                        completed = ?state.completed_steps,
                        "State loaded from pipeline_state"
                    );
                    return Ok(Some(state));
                }
                Ok(Err(e)) => warn!(job_id = %job_id, error = %e, "pipeline_state corrupt, using legacy columns"),
                Err(e) => warn!(job_id = %job_id, error = %e, "pipeline_state unparseable, using legacy columns"),
            }
        }

        let state = Self::reconstruct_from_legacy(&row);
        info!(job_id = %job_id, "State reconstructed from legacy columns");
        Ok(Some(state))
    }

    async fn save(
        &self,
        job_id: &str,
        state: &PipelineState,
        step_name: &str,
    ) -> pipeline_core::Result<()> {
        let state_json = serde_json::to_string(state)?;
        let steps_json = serde_json::to_string(&Self::build_steps_json(state))?;
        let legacy = Self::legacy_values(state);

        let mut sets: Vec<String> = vec![
            "pipeline_state = ?".to_string(),
            "steps = ?".to_string(),
        ];
        for (col, _) in &legacy {
            sets.push(format!("{col} = ?"));
        }
        let sql = format!(
            "UPDATE video_jobs SET {} WHERE job_id = ?",
            sets.join(", ")
        );

        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut query = sqlx::query(&sql).bind(&state_json).bind(&steps_json);
        for (_, value) in &legacy {
            query = match value {
                LegacyValue::Text(s) => query.bind(s),
                LegacyValue::Int(i) => query.bind(i),
            };
        }
        let result = query
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        tx.commit().await.map_err(store_err)?;

        info!(
            job_id = %job_id,
            step = %step_name,
            completed = state.completed_steps.len(),
            "State saved"
        );
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> pipeline_core::Result<()> {
        let result = if let Some(error) = error {
            sqlx::query("UPDATE video_jobs SET status = ?, error_message = ? WHERE job_id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(job_id)
                .execute(&self.pool)
                .await
        } else {
            sqlx::query("UPDATE video_jobs SET status = ? WHERE job_id = ?")
                .bind(status.as_str())
                .bind(job_id)
                .execute(&self.pool)
                .await
        }
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }
}
