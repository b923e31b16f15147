//! Job row model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One row of `video_jobs`.
///
/// `pipeline_state` carries the engine's JSON state; the remaining columns
/// are the legacy projection kept for code that has not migrated yet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VideoJobRow {
    pub job_id: String,
    pub project_id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub status: String,
    pub pipeline_state: Option<String>,
    pub steps: Option<String>,
    pub error_message: Option<String>,

    pub videos: Option<String>,
    pub options: Option<String>,
    pub webhook_url: Option<String>,

    pub original_video_url: Option<String>,
    pub phase1_video_url: Option<String>,
    pub phase1_audio_url: Option<String>,
    pub phase2_video_url: Option<String>,
    pub output_video_url: Option<String>,
    pub matted_video_url: Option<String>,
    pub base_normalized_url: Option<String>,

    pub transcription_text: Option<String>,
    pub transcription_words: Option<String>,
    pub phrase_groups: Option<String>,
    pub png_results: Option<String>,
    pub shadow_results: Option<String>,
    pub speech_segments: Option<String>,
    pub cut_timestamps: Option<String>,
    pub foreground_segments: Option<String>,
    pub matting_segments: Option<String>,
    pub normalization_stats: Option<String>,
    pub untranscribed_segments: Option<String>,
    pub phase1_source: Option<String>,
    pub phase1_metadata: Option<String>,
    pub total_duration_ms: Option<i64>,

    pub created_at: String,
}
