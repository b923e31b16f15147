//! Pipeline state model
//!
//! [`PipelineState`] is the single value that flows through every step of a
//! job. It is logically immutable: a step receives the current value and
//! yields a new one via [`PipelineState::with_updates`]. The state manager
//! persists the value after each step, so any step (or any step's failure)
//! is recoverable and replayable.

use crate::{Result, ENGINE_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Storytelling mode selecting which pipeline variant a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorytellingMode {
    /// Input footage with a speaking subject (default)
    #[default]
    TalkingHead,
    /// No input footage; script text drives virtual timestamps
    TextVideo,
    /// Script-driven visual layout rendered as motion graphics
    MotionGraphics,
}

impl StorytellingMode {
    /// Stable string form used in persisted state
    pub fn as_str(&self) -> &'static str {
        match self {
            StorytellingMode::TalkingHead => "talking_head",
            StorytellingMode::TextVideo => "text_video",
            StorytellingMode::MotionGraphics => "motion_graphics",
        }
    }
}

/// Timing record kept per executed (or skipped) step
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StepTiming {
    /// RFC3339 timestamp of the first attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// Wall-clock duration until the terminal attempt finished
    #[serde(default)]
    pub duration_ms: i64,

    /// Attempt number that terminated the step (1-based)
    #[serde(default = "default_attempt")]
    pub attempt: u32,

    /// Error message for skipped optional steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// True when the step was skipped after a terminal optional failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
}

fn default_attempt() -> u32 {
    1
}

fn default_enabled_types() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_video_width() -> u32 {
    1080
}

fn default_video_height() -> u32 {
    1920
}

fn default_engine_version() -> String {
    ENGINE_VERSION.to_string()
}

/// Centralized, immutable pipeline state.
///
/// Each step receives an instance and returns a new one. Unknown fields in
/// persisted JSON are ignored on load (forward compatibility) and missing
/// fields take their defaults, so states written by older engine versions
/// keep loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineState {
    // ── Identity (immutable after creation) ──
    pub job_id: String,
    pub project_id: String,
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub template_id: Option<String>,

    // ── Configuration (immutable after creation) ──
    pub videos: Vec<Value>,
    pub options: Value,
    pub webhook_url: Option<String>,

    // ── Template (loaded once by the template step) ──
    pub template_config: Option<Value>,
    pub text_styles: Option<Value>,
    #[serde(default = "default_enabled_types")]
    pub enabled_types: Vec<String>,
    #[serde(default = "default_video_width")]
    pub video_width: u32,
    #[serde(default = "default_video_height")]
    pub video_height: u32,

    // Upload resolution and target aspect ratio ("9:16" | "16:9" | "1:1" | "")
    pub upload_width: u32,
    pub upload_height: u32,
    pub target_aspect_ratio: String,

    // ── Video URLs ──
    pub original_video_url: Option<String>,
    pub normalized_video_url: Option<String>,
    pub concatenated_video_url: Option<String>,
    pub phase1_video_url: Option<String>,
    pub phase1_audio_url: Option<String>,
    pub phase1_video_concatenated_url: Option<String>,
    pub phase2_video_url: Option<String>,
    pub output_video_url: Option<String>,
    pub matted_video_url: Option<String>,
    pub base_normalized_url: Option<String>,
    pub matting_artifacts_url: Option<String>,

    // ── Processing results ──
    pub normalization_stats: Option<Value>,
    pub silence_detection: Option<Value>,
    pub cut_timestamps: Option<Value>,
    pub speech_segments: Option<Value>,
    pub untranscribed_segments: Option<Value>,
    pub transcription_text: Option<String>,
    pub transcription_words: Option<Value>,
    pub phrase_groups: Option<Value>,
    pub png_results: Option<Value>,
    pub shadow_results: Option<Value>,
    pub animation_results: Option<Value>,
    pub positioning_results: Option<Value>,
    pub background_results: Option<Value>,
    pub motion_graphics_plan: Option<Value>,
    pub motion_graphics_rendered: Option<Value>,
    pub matting_segments: Option<Value>,
    pub foreground_segments: Option<Value>,
    pub matting_config_hash: Option<String>,
    pub cartela_results: Option<Value>,
    pub subtitle_payload: Option<Value>,
    pub tectonic_plates: Option<Value>,

    // ── Visual analysis ──
    pub visual_analysis: Option<Value>,
    pub shot_list: Option<Value>,
    pub edit_decision_list: Option<Value>,
    pub content_type_detected: Option<String>,

    // ── Overlay tracks ──
    pub video_clipper_track: Option<Value>,
    pub title_track: Option<Value>,
    pub title_overrides: Option<Value>,

    // ── Text-video mode ──
    pub storytelling_mode: StorytellingMode,
    pub clean_text: Option<String>,
    pub scene_overrides: Option<Value>,

    // ── Metadata ──
    pub total_duration_ms: Option<i64>,
    pub phase1_source: Option<String>,
    pub phase1_metadata: Option<Value>,
    pub error_message: Option<String>,

    // ── Tracking (engine-managed) ──
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub failed_step: Option<String>,
    pub step_timings: BTreeMap<String, StepTiming>,

    // ── Versioning ──
    #[serde(default = "default_engine_version")]
    pub engine_version: String,
    pub created_at: Option<String>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            project_id: String::new(),
            user_id: String::new(),
            conversation_id: None,
            template_id: None,
            videos: Vec::new(),
            options: json!({}),
            webhook_url: None,
            template_config: None,
            text_styles: None,
            enabled_types: default_enabled_types(),
            video_width: default_video_width(),
            video_height: default_video_height(),
            upload_width: 0,
            upload_height: 0,
            target_aspect_ratio: String::new(),
            original_video_url: None,
            normalized_video_url: None,
            concatenated_video_url: None,
            phase1_video_url: None,
            phase1_audio_url: None,
            phase1_video_concatenated_url: None,
            phase2_video_url: None,
            output_video_url: None,
            matted_video_url: None,
            base_normalized_url: None,
            matting_artifacts_url: None,
            normalization_stats: None,
            silence_detection: None,
            cut_timestamps: None,
            speech_segments: None,
            untranscribed_segments: None,
            transcription_text: None,
            transcription_words: None,
            phrase_groups: None,
            png_results: None,
            shadow_results: None,
            animation_results: None,
            positioning_results: None,
            background_results: None,
            motion_graphics_plan: None,
            motion_graphics_rendered: None,
            matting_segments: None,
            foreground_segments: None,
            matting_config_hash: None,
            cartela_results: None,
            subtitle_payload: None,
            tectonic_plates: None,
            visual_analysis: None,
            shot_list: None,
            edit_decision_list: None,
            content_type_detected: None,
            video_clipper_track: None,
            title_track: None,
            title_overrides: None,
            storytelling_mode: StorytellingMode::default(),
            clean_text: None,
            scene_overrides: None,
            total_duration_ms: None,
            phase1_source: None,
            phase1_metadata: None,
            error_message: None,
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            failed_step: None,
            step_timings: BTreeMap::new(),
            engine_version: default_engine_version(),
            created_at: None,
        }
    }
}

impl PipelineState {
    /// Create a state for a new job with identity fields set
    pub fn new(
        job_id: impl Into<String>,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            project_id: project_id.into(),
            user_id: user_id.into(),
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        }
    }

    /// Return a new instance with fields updated by the closure.
    ///
    /// This is the copy-with-overrides operation: the receiver is never
    /// mutated. Nested collections are shared structurally via clone; only
    /// the fields the closure touches change.
    pub fn with_updates(&self, f: impl FnOnce(&mut PipelineState)) -> PipelineState {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// Serialize to a JSON value (for persistence, checkpoints and debug)
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a JSON value. Unknown fields are ignored.
    pub fn from_value(value: Value) -> Result<PipelineState> {
        Ok(serde_json::from_value(value)?)
    }

    /// Best available video URL for the current step
    pub fn get_video_url_for_processing(&self) -> Option<String> {
        self.phase1_video_url
            .clone()
            .or_else(|| self.concatenated_video_url.clone())
            .or_else(|| self.normalized_video_url.clone())
            .or_else(|| self.original_video_url.clone())
            .or_else(|| {
                self.videos
                    .first()
                    .and_then(|v| v.get("url"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
    }

    /// Best available audio URL for transcription
    pub fn get_audio_url_for_transcription(&self) -> Option<String> {
        self.phase1_audio_url
            .clone()
            .or_else(|| self.phase1_video_concatenated_url.clone())
            .or_else(|| self.get_video_url_for_processing())
    }

    /// Record a step as completed, preserving completion order
    pub fn mark_completed(&mut self, step_name: &str) {
        if !self.completed_steps.iter().any(|s| s == step_name) {
            self.completed_steps.push(step_name.to_string());
        }
    }

    /// Record a step as skipped
    pub fn mark_skipped(&mut self, step_name: &str) {
        if !self.skipped_steps.iter().any(|s| s == step_name) {
            self.skipped_steps.push(step_name.to_string());
        }
    }

    /// Compact summary for logs and external drivers
    pub fn summary(&self) -> Value {
        let len_of = |v: &Option<Value>| v.as_ref().and_then(Value::as_array).map_or(0, Vec::len);
        json!({
            "job_id": self.job_id,
            "template_id": self.template_id,
            "storytelling_mode": self.storytelling_mode.as_str(),
            "completed_steps": self.completed_steps,
            "failed_step": self.failed_step,
            "phrase_count": len_of(&self.phrase_groups),
            "has_template": self.template_config.is_some(),
            "has_pngs": self.png_results.is_some(),
            "has_transcription": self.transcription_text.is_some(),
            "has_visual_analysis": self.visual_analysis.is_some(),
            "has_video_clipper_track": self.video_clipper_track.is_some(),
            "video_clipper_brolls": len_of(&self.video_clipper_track),
            "has_title_track": self.title_track.is_some(),
            "has_scene_overrides": self.scene_overrides.is_some(),
            "scene_count": len_of(&self.scene_overrides),
            "content_type": self.content_type_detected,
            "shot_count": len_of(&self.shot_list),
            "duration_ms": self.total_duration_ms,
            "video_dimensions": format!("{}x{}", self.video_width, self.video_height),
            "phase1_source": self.phase1_source,
        })
    }
}

/// Result of a single step execution, returned by
/// [`PipelineEngine::run_step`](crate::engine::PipelineEngine::run_step)
/// for external drivers to inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub success: bool,
    #[serde(default)]
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_summary: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StepResult {
    /// A successful result
    pub fn success(step_name: impl Into<String>, duration_ms: i64, state_summary: Value) -> Self {
        Self {
            step_name: step_name.into(),
            success: true,
            duration_ms,
            error: None,
            state_summary: Some(state_summary),
            metadata: None,
        }
    }

    /// A failed result
    pub fn failure(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            success: false,
            duration_ms: 0,
            error: Some(error.into()),
            state_summary: None,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_updates_leaves_original_untouched() {
        let state = PipelineState::new("job-1", "proj-1", "user-1");
        let next = state.with_updates(|s| {
            s.transcription_text = Some("hello".to_string());
            s.mark_completed("transcribe");
        });

        assert!(state.transcription_text.is_none());
        assert!(state.completed_steps.is_empty());
        assert_eq!(next.transcription_text.as_deref(), Some("hello"));
        assert_eq!(next.completed_steps, vec!["transcribe"]);
        assert_eq!(next.job_id, "job-1");
    }

    #[test]
    fn test_with_updates_is_shallow_merge_over_projection() {
        // with_updates(f).to_value() == to_value() with only the touched keys changed
        let state = PipelineState::new("job-1", "proj-1", "user-1");
        let next = state.with_updates(|s| s.phase1_video_url = Some("http://x/v.mp4".into()));

        let mut expected = state.to_value().unwrap();
        expected["phase1_video_url"] = json!("http://x/v.mp4");
        assert_eq!(next.to_value().unwrap(), expected);
    }

    #[test]
    fn test_round_trip_is_stable() {
        let mut state = PipelineState::new("job-1", "proj-1", "user-1");
        state.phrase_groups = Some(json!([{"text": "hi"}]));
        state.step_timings.insert(
            "transcribe".to_string(),
            StepTiming {
                started_at: Some("2026-01-01T00:00:00Z".into()),
                duration_ms: 1200,
                attempt: 2,
                error: None,
                skipped: false,
            },
        );

        let once = serde_json::to_string(&PipelineState::from_value(state.to_value().unwrap()).unwrap()).unwrap();
        let twice = serde_json::to_string(
            &PipelineState::from_value(serde_json::from_str::<Value>(&once).unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_from_value_ignores_unknown_fields() {
        let value = json!({
            "job_id": "job-1",
            "some_future_field": {"nested": true},
            "completed_steps": ["load_template"]
        });
        let state = PipelineState::from_value(value).unwrap();
        assert_eq!(state.job_id, "job-1");
        assert_eq!(state.completed_steps, vec!["load_template"]);
        assert_eq!(state.video_width, 1080);
        assert_eq!(state.engine_version, ENGINE_VERSION);
    }

    #[test]
    fn test_video_url_fallback_chain() {
        let mut state = PipelineState::default();
        state.videos = vec![json!({"url": "http://x/raw.mp4"})];
        assert_eq!(
            state.get_video_url_for_processing().as_deref(),
            Some("http://x/raw.mp4")
        );

        state.original_video_url = Some("http://x/orig.mp4".into());
        assert_eq!(
            state.get_video_url_for_processing().as_deref(),
            Some("http://x/orig.mp4")
        );

        state.phase1_video_url = Some("http://x/p1.mp4".into());
        assert_eq!(
            state.get_video_url_for_processing().as_deref(),
            Some("http://x/p1.mp4")
        );
    }

    #[test]
    fn test_mark_completed_is_idempotent_and_ordered() {
        let mut state = PipelineState::default();
        state.mark_completed("a");
        state.mark_completed("b");
        state.mark_completed("a");
        assert_eq!(state.completed_steps, vec!["a", "b"]);
    }

    #[test]
    fn test_storytelling_mode_serde() {
        let state = PipelineState {
            storytelling_mode: StorytellingMode::TextVideo,
            ..Default::default()
        };
        let value = state.to_value().unwrap();
        assert_eq!(value["storytelling_mode"], json!("text_video"));

        let back = PipelineState::from_value(value).unwrap();
        assert_eq!(back.storytelling_mode, StorytellingMode::TextVideo);
    }

    #[test]
    fn test_summary_counts() {
        let mut state = PipelineState::new("job-1", "p", "u");
        state.phrase_groups = Some(json!([{}, {}, {}]));
        state.video_clipper_track = Some(json!([{}]));
        let summary = state.summary();
        assert_eq!(summary["phrase_count"], json!(3));
        assert_eq!(summary["video_clipper_brolls"], json!(1));
        assert_eq!(summary["video_dimensions"], json!("1080x1920"));
    }
}
