//! Auto runner - fixed step lists for the five operating modes
//!
//! Zero-decision driver: each mode hands the engine a preset list and lets
//! the registry order it. `ALL_STEPS` is the canonical list the replay
//! engine measures positions against.

use pipeline_core::{PipelineEngine, PipelineState, Result, StorytellingMode};
use std::sync::Arc;
use tracing::info;

/// Phase 1: preprocessing up to classification (then human review)
pub const PHASE_1_STEPS: &[&str] = &[
    "load_template",
    "normalize",
    "apply_retake_cuts",
    "concat",
    "analyze",
    "detect_silence",
    "silence_cut",
    "concat_plates",
    "transcribe",
    "merge_transcriptions",
    "fraseamento",
    "classify",
];

/// Phase 2: rendering, resumed after review
pub const PHASE_2_STEPS: &[&str] = &[
    "load_template",
    "classify",
    "video_clipper",
    "generate_pngs",
    "add_shadows",
    "apply_animations",
    "calculate_positions",
    "generate_backgrounds",
    "motion_graphics",
    "matting",
    "cartelas",
    "subtitle_pipeline",
    "title_generation",
    "render",
];

/// Canonical full pipeline (phase 1 + phase 2). Replay positions are
/// computed against this list.
pub const ALL_STEPS: &[&str] = &[
    "load_template",
    "normalize",
    "apply_retake_cuts",
    "concat",
    "analyze",
    "detect_silence",
    "silence_cut",
    "concat_plates",
    "transcribe",
    "video_clipper",
    "merge_transcriptions",
    "fraseamento",
    "classify",
    "generate_pngs",
    "add_shadows",
    "apply_animations",
    "calculate_positions",
    "generate_backgrounds",
    "motion_graphics",
    "matting",
    "cartelas",
    "subtitle_pipeline",
    "title_generation",
    "render",
];

/// Full pipeline with visual analysis enabled
pub const ALL_STEPS_WITH_VISUAL: &[&str] = &[
    "load_template",
    "normalize",
    "apply_retake_cuts",
    "concat",
    "analyze",
    "detect_silence",
    "silence_cut",
    "concat_plates",
    "visual_analysis",
    "transcribe",
    "video_clipper",
    "merge_transcriptions",
    "fraseamento",
    "classify",
    "generate_pngs",
    "add_shadows",
    "apply_animations",
    "calculate_positions",
    "generate_backgrounds",
    "motion_graphics",
    "matting",
    "cartelas",
    "subtitle_pipeline",
    "title_generation",
    "render",
];

/// Text-video mode: no input footage, script text drives virtual timestamps
pub const TEXT_VIDEO_STEPS: &[&str] = &[
    "load_template",
    "format_script",
    "generate_timestamps",
    "fraseamento",
    "classify",
    "generate_pngs",
    "add_shadows",
    "apply_animations",
    "calculate_positions",
    "generate_backgrounds",
    "cartelas",
    "subtitle_pipeline",
    "title_generation",
    "render",
];

/// Motion-graphics mode: script to agent-driven visual layout to video
pub const MOTION_GRAPHICS_STEPS: &[&str] = &[
    "load_template",
    "format_script",
    "generate_timestamps",
    "fraseamento",
    "generate_visual_layout",
    "subtitle_pipeline",
    "title_generation",
    "render",
];

/// Step after which phase-1-only runs pause for review
pub const REVIEW_GATE_STEP: &str = "classify";

fn owned(steps: &[&str]) -> Vec<String> {
    steps.iter().map(|s| s.to_string()).collect()
}

/// Runs the pipeline with preset step lists
pub struct AutoRunner {
    engine: Arc<PipelineEngine>,
}

impl AutoRunner {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self { engine }
    }

    /// Complete pipeline (phase 1 + phase 2)
    pub async fn run_full(
        &self,
        job_id: &str,
        state: Option<PipelineState>,
        include_visual: bool,
    ) -> Result<PipelineState> {
        let steps = if include_visual {
            ALL_STEPS_WITH_VISUAL
        } else {
            ALL_STEPS
        };
        info!(job_id = %job_id, include_visual, "Auto run: full pipeline");
        self.engine.run(job_id, &owned(steps), state, None).await
    }

    /// Phase 1 only; the job pauses in `awaiting_review` after the gate step
    pub async fn run_phase1_only(
        &self,
        job_id: &str,
        state: Option<PipelineState>,
    ) -> Result<PipelineState> {
        info!(job_id = %job_id, "Auto run: phase 1");
        self.engine
            .run(job_id, &owned(PHASE_1_STEPS), state, Some(REVIEW_GATE_STEP))
            .await
    }

    /// Phase 2, after human review. A custom step list may override the
    /// preset (partial re-renders).
    pub async fn run_phase2(
        &self,
        job_id: &str,
        steps: Option<Vec<String>>,
        state: Option<PipelineState>,
    ) -> Result<PipelineState> {
        let steps = steps.unwrap_or_else(|| owned(PHASE_2_STEPS));
        info!(job_id = %job_id, steps = ?steps, "Auto run: phase 2");
        self.engine.run(job_id, &steps, state, None).await
    }

    /// Text-video pipeline (no input footage)
    pub async fn run_text_video(
        &self,
        job_id: &str,
        state: Option<PipelineState>,
    ) -> Result<PipelineState> {
        info!(job_id = %job_id, "Auto run: text video");
        let state = state.map(|s| {
            if s.storytelling_mode != StorytellingMode::TextVideo {
                s.with_updates(|s| s.storytelling_mode = StorytellingMode::TextVideo)
            } else {
                s
            }
        });
        self.engine
            .run(job_id, &owned(TEXT_VIDEO_STEPS), state, None)
            .await
    }

    /// Motion-graphics pipeline (script to layered visuals)
    pub async fn run_motion_graphics(
        &self,
        job_id: &str,
        state: Option<PipelineState>,
    ) -> Result<PipelineState> {
        info!(job_id = %job_id, "Auto run: motion graphics");
        let state = state.map(|s| {
            if s.storytelling_mode != StorytellingMode::MotionGraphics {
                s.with_updates(|s| s.storytelling_mode = StorytellingMode::MotionGraphics)
            } else {
                s
            }
        });
        self.engine
            .run(job_id, &owned(MOTION_GRAPHICS_STEPS), state, None)
            .await
    }

    /// Escape hatch: run an arbitrary step list
    pub async fn run_custom(
        &self,
        job_id: &str,
        steps: Vec<String>,
        state: Option<PipelineState>,
        stop_after: Option<&str>,
    ) -> Result<PipelineState> {
        info!(job_id = %job_id, steps = ?steps, "Auto run: custom");
        self.engine.run(job_id, &steps, state, stop_after).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_subsets_of_the_canonical_list() {
        for step in PHASE_1_STEPS.iter().chain(PHASE_2_STEPS.iter()) {
            assert!(ALL_STEPS.contains(step), "{step} missing from ALL_STEPS");
        }
    }

    #[test]
    fn test_canonical_list_ends_with_render_and_has_no_duplicates() {
        assert_eq!(*ALL_STEPS.last().unwrap(), "render");
        let mut seen = std::collections::HashSet::new();
        for step in ALL_STEPS {
            assert!(seen.insert(step), "duplicate step {step}");
        }
    }

    #[test]
    fn test_review_gate_is_in_phase_1() {
        assert!(PHASE_1_STEPS.contains(&REVIEW_GATE_STEP));
    }
}
