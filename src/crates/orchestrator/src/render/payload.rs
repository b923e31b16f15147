//! Render payload assembly
//!
//! Builds the document a render worker consumes: project settings, tracks,
//! base layer, quality profile and the upload-path descriptor telling the
//! worker where the finished file must land.

use crate::db::connection::DatabasePool;
use crate::db::repositories::RenderVersionRepository;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// Sentinel base URLs for footage-less modes
pub const TEXT_VIDEO_NO_BASE: &str = "__TEXT_VIDEO_NO_BASE__";
pub const HYBRID_MODE_BASE: &str = "__HYBRID_MODE_USE_SPEECH_SEGMENTS__";

/// Encoder settings derived from the template's quality + preset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualitySettings {
    pub crf: i32,
    pub codec: String,
    pub pixel_format: String,
    pub audio_bitrate: String,
    pub preset: String,
}

/// CRF base per quality tier (lower is better)
fn quality_to_crf(quality: &str) -> i32 {
    match quality {
        "ultra" => 15,
        "high" => 18,
        "medium" => 23,
        "low" => 28,
        "draft" => 32,
        _ => 23,
    }
}

/// CRF adjustment per encoder preset: slower presets compress better, so
/// they can afford a lower CRF at the same perceived quality.
fn preset_adjustment(preset: &str) -> i32 {
    match preset {
        "ultrafast" => 4,
        "superfast" => 3,
        "veryfast" => 2,
        "faster" => 1,
        "fast" | "medium" => 0,
        "slow" => -1,
        "slower" => -2,
        "veryslow" => -3,
        "placebo" => -4,
        _ => 0,
    }
}

/// Compute the quality profile from the payload's declared quality/preset.
/// The final CRF is clamped to [10, 35].
pub fn quality_settings(payload: &Value) -> QualitySettings {
    let quality = payload
        .get("quality")
        .and_then(Value::as_str)
        .unwrap_or("high");
    let preset = payload
        .get("preset")
        .and_then(Value::as_str)
        .unwrap_or("medium");

    let crf = (quality_to_crf(quality) + preset_adjustment(preset)).clamp(10, 35);
    let audio_bitrate = if matches!(quality, "ultra" | "high") {
        "192k"
    } else {
        "128k"
    };

    info!(quality, preset, crf, "Quality profile computed");
    QualitySettings {
        crf,
        codec: "h264".to_string(),
        pixel_format: "yuv420p".to_string(),
        audio_bitrate: audio_bitrate.to_string(),
        preset: preset.to_string(),
    }
}

/// Structured upload path: deterministic location per user/project/version
pub fn structured_render_path(
    user_id: &str,
    project_id: &str,
    job_id: &str,
    version: i64,
    phase: i32,
) -> String {
    let suffix = if phase == 1 { "_phase1" } else { "" };
    format!("users/{user_id}/projects/{project_id}/renders/{job_id}_v{version}{suffix}.mp4")
}

/// Legacy flat upload path
pub fn legacy_render_path(job_id: &str) -> String {
    format!("{job_id}_final.mp4")
}

/// Upload-path descriptor handed to the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub enabled: bool,
    pub use_structured_path: bool,
    pub path: String,
    pub user_id: String,
    pub project_id: String,
    pub job_id: String,
    pub phase: i32,
    pub version: i64,
    pub legacy_path: String,
}

/// Compute the upload descriptor; the version number comes from the
/// `render_versions` counter scoped by `(project_id, phase)`. A version
/// lookup failure degrades to v1 with a warning.
pub async fn build_upload_config(
    pool: &DatabasePool,
    use_structured_paths: bool,
    user_id: &str,
    project_id: &str,
    job_id: &str,
    phase: i32,
) -> UploadConfig {
    let version = match RenderVersionRepository::next_version(pool, project_id, phase).await {
        Ok(version) => version,
        Err(e) => {
            warn!(error = %e, "Version lookup failed, defaulting to v1");
            1
        }
    };

    let path = structured_render_path(user_id, project_id, job_id, version, phase);
    info!(
        structured = use_structured_paths,
        version,
        path = %path,
        "Upload config computed"
    );

    UploadConfig {
        enabled: use_structured_paths,
        use_structured_path: use_structured_paths,
        path,
        user_id: user_id.to_string(),
        project_id: project_id.to_string(),
        job_id: job_id.to_string(),
        phase,
        version,
        legacy_path: legacy_render_path(job_id),
    }
}

/// Build the base layer, preserving extras (zoom keyframes and friends)
/// carried on the incoming payload.
///
/// Returns `(base_type, base_layer)`.
pub fn build_base_layer(payload: &Value, video_url: &str) -> (String, Value) {
    let existing = payload.get("base_layer").cloned().unwrap_or(json!({}));

    if !video_url.is_empty() && video_url != TEXT_VIDEO_NO_BASE && video_url != HYBRID_MODE_BASE {
        // Video mode: keep the existing video_base config, pin the URL
        let mut video_base = existing
            .get("video_base")
            .cloned()
            .unwrap_or_else(|| json!({}));
        video_base["urls"] = json!([video_url]);
        return ("video".to_string(), json!({"video_base": video_base}));
    }

    let base_type = payload
        .get("base_type")
        .and_then(Value::as_str)
        .unwrap_or("solid")
        .to_string();
    if existing.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        (base_type, existing)
    } else {
        (
            base_type,
            json!({"solid_base": {"color": "#000000", "opacity": 1}}),
        )
    }
}

/// Assemble the full worker payload from the pipeline's subtitle payload.
///
/// Signed-URL renewal is a separate pass run by the dispatch services after
/// assembly, so the URLs embedded here may still carry stale signatures.
#[allow(clippy::too_many_arguments)]
pub async fn build_render_payload(
    pool: &DatabasePool,
    use_structured_paths: bool,
    job_id: &str,
    payload: &Value,
    user_id: &str,
    project_id: &str,
    template_id: Option<&str>,
    webhook_url: &str,
) -> Result<Value> {
    let tracks = payload.get("tracks").cloned().unwrap_or(json!({}));
    let subtitle_count = tracks
        .get("subtitles")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let canvas = payload
        .get("canvas")
        .cloned()
        .unwrap_or(json!({"width": 720, "height": 1280}));
    let fps = payload.get("fps").and_then(Value::as_i64).unwrap_or(30);
    let duration_in_frames = payload
        .get("duration_in_frames")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let video_url = payload
        .get("video_url")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let project_settings = json!({
        "video_settings": {
            "width": canvas.get("width").and_then(Value::as_i64).unwrap_or(720),
            "height": canvas.get("height").and_then(Value::as_i64).unwrap_or(1280),
            "fps": fps,
            "duration_in_frames": duration_in_frames,
        }
    });

    let (base_type, base_layer) = build_base_layer(payload, &video_url);
    let quality = quality_settings(payload);
    let upload_config = build_upload_config(
        pool,
        use_structured_paths,
        user_id,
        project_id,
        job_id,
        2,
    )
    .await;

    let render_settings = payload.get("render_settings").cloned().unwrap_or(json!({
        "solid_background": video_url.is_empty(),
        "background_color": "#000000",
    }));

    let mut render_payload = json!({
        // Both spellings: older workers read the camelCase one
        "jobId": job_id,
        "job_id": job_id,

        "user_id": user_id,
        "project_id": project_id,
        "template_id": template_id,

        "webhook_url": webhook_url,
        "webhook_metadata": {
            "job_id": job_id,
            "user_id": user_id,
            "project_id": project_id,
            "template_id": template_id,
            "source": "video_orchestrator",
        },

        "project_settings": project_settings,
        "canvas": canvas,
        "fps": fps,
        "duration_in_frames": duration_in_frames,
        "video_url": video_url,

        "tracks": tracks,
        "base_type": base_type,
        "base_layer": base_layer,

        "render_settings": render_settings,
        "quality_settings": quality,
        "b2_upload_config": upload_config,
    });

    if let Some(animation_config) = payload.get("subtitle_animation_config") {
        render_payload["subtitle_animation_config"] = animation_config.clone();
    }

    info!(
        job_id = %job_id,
        subtitles = subtitle_count,
        base_type = %render_payload["base_type"].as_str().unwrap_or(""),
        "Render payload assembled"
    );
    Ok(render_payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;

    #[test]
    fn test_quality_profile_mapping() {
        let q = quality_settings(&json!({"quality": "high", "preset": "medium"}));
        assert_eq!(q.crf, 18);
        assert_eq!(q.audio_bitrate, "192k");

        let q = quality_settings(&json!({"quality": "low", "preset": "ultrafast"}));
        assert_eq!(q.crf, 32);
        assert_eq!(q.audio_bitrate, "128k");

        // Defaults: high/medium
        let q = quality_settings(&json!({}));
        assert_eq!(q.crf, 18);
        assert_eq!(q.preset, "medium");
    }

    #[test]
    fn test_quality_crf_is_clamped() {
        // ultra + placebo would be 11; draft + ultrafast would be 36
        let q = quality_settings(&json!({"quality": "ultra", "preset": "placebo"}));
        assert_eq!(q.crf, 11);
        let q = quality_settings(&json!({"quality": "draft", "preset": "ultrafast"}));
        assert_eq!(q.crf, 35);
    }

    #[test]
    fn test_base_layer_video_mode_preserves_extras() {
        let payload = json!({
            "base_layer": {"video_base": {"zoom_keyframes": [{"frame": 0, "zoom": 1.2}]}}
        });
        let (base_type, layer) = build_base_layer(&payload, "http://x/v.mp4");
        assert_eq!(base_type, "video");
        assert_eq!(layer["video_base"]["urls"], json!(["http://x/v.mp4"]));
        assert_eq!(layer["video_base"]["zoom_keyframes"][0]["zoom"], json!(1.2));
    }

    #[test]
    fn test_base_layer_sentinels_keep_original() {
        let payload = json!({"base_type": "solid", "base_layer": {"solid_base": {"color": "#123"}}});
        let (base_type, layer) = build_base_layer(&payload, TEXT_VIDEO_NO_BASE);
        assert_eq!(base_type, "solid");
        assert_eq!(layer["solid_base"]["color"], json!("#123"));

        let (_, default_layer) = build_base_layer(&json!({}), "");
        assert_eq!(default_layer["solid_base"]["color"], json!("#000000"));
    }

    #[test]
    fn test_render_path_shapes() {
        assert_eq!(
            structured_render_path("u1", "p1", "j1", 3, 2),
            "users/u1/projects/p1/renders/j1_v3.mp4"
        );
        assert_eq!(
            structured_render_path("u1", "p1", "j1", 1, 1),
            "users/u1/projects/p1/renders/j1_v1_phase1.mp4"
        );
        assert_eq!(legacy_render_path("j1"), "j1_final.mp4");
    }

    #[tokio::test]
    async fn test_build_render_payload_shape() {
        let conn = DatabaseConnection::with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        conn.run_migrations().await.unwrap();
        RenderVersionRepository::record(conn.pool(), "p1", "old-job", 2, 1)
            .await
            .unwrap();

        let payload = json!({
            "tracks": {"subtitles": [{"text": "hi"}]},
            "canvas": {"width": 1080, "height": 1920},
            "fps": 30,
            "duration_in_frames": 900,
            "video_url": "http://x/v.mp4",
            "quality": "high",
            "preset": "slow",
            "subtitle_animation_config": {"style": "pop"},
        });

        let rendered = build_render_payload(
            conn.pool(),
            true,
            "job-1",
            &payload,
            "u1",
            "p1",
            Some("tpl-1"),
            "https://api.vinicius.ai/api/webhook/render-complete",
        )
        .await
        .unwrap();

        assert_eq!(rendered["jobId"], json!("job-1"));
        assert_eq!(rendered["job_id"], json!("job-1"));
        assert_eq!(
            rendered["project_settings"]["video_settings"]["width"],
            json!(1080)
        );
        assert_eq!(
            rendered["project_settings"]["video_settings"]["duration_in_frames"],
            json!(900)
        );
        assert_eq!(rendered["base_type"], json!("video"));
        assert_eq!(rendered["quality_settings"]["crf"], json!(17));
        assert_eq!(rendered["webhook_metadata"]["source"], json!("video_orchestrator"));
        assert_eq!(rendered["subtitle_animation_config"]["style"], json!("pop"));

        // Version counter: one prior render in phase 2 -> v2
        assert_eq!(rendered["b2_upload_config"]["version"], json!(2));
        assert_eq!(
            rendered["b2_upload_config"]["path"],
            json!("users/u1/projects/p1/renders/job-1_v2.mp4")
        );
    }
}
