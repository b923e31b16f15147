//! Pipeline replay - partial re-execution from an arbitrary step
//!
//! Reconstructs the state as it was before a target step (from the
//! checkpoint of the step immediately preceding it), applies targeted
//! dot-notation modifications, and computes the tail of the canonical step
//! list to re-run. This makes experimentation cheap: change a color and
//! re-run only from PNG generation forward, without re-spending the
//! expensive upstream compute.
//!
//! Async subflow outputs need special care: a non-await checkpoint does not
//! contain them, so dependencies of steps-to-rerun that will not themselves
//! re-run are recovered from their `await_<name>` checkpoint (or their own).

use crate::auto_runner::ALL_STEPS;
use crate::{OrchestratorError, Result};
use pipeline_checkpoint::CheckpointStore;
use pipeline_core::{PipelineState, StateStore, StepRegistry};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// Fields that can never be modified through replay: identity, URLs that
/// predate the pipeline, canvas dimensions, tracking and engine metadata.
pub const BLOCKED_FIELDS: &[&str] = &[
    "job_id",
    "project_id",
    "user_id",
    "conversation_id",
    "webhook_url",
    "original_video_url",
    "video_width",
    "video_height",
    "completed_steps",
    "skipped_steps",
    "failed_step",
    "step_timings",
    "error_message",
    "engine_version",
    "created_at",
];

/// Async-merge extras recovered alongside `produces` fields
const EXTRA_MERGE_FIELDS: &[&str] = &["matted_video_url"];

/// Rough per-step cost in seconds, for replay time estimates
pub fn step_cost_estimate(step: &str) -> u64 {
    match step {
        "load_template" => 2,
        "normalize" => 15,
        "concat" => 10,
        "analyze" => 5,
        "detect_silence" => 5,
        "silence_cut" => 10,
        "transcribe" => 30,
        "video_clipper" => 15,
        "merge_transcriptions" => 2,
        "fraseamento" => 5,
        "classify" => 8,
        "generate_pngs" => 15,
        "add_shadows" => 5,
        "apply_animations" => 3,
        "calculate_positions" => 3,
        "generate_backgrounds" => 10,
        "motion_graphics" => 45,
        "matting" => 75,
        "cartelas" => 5,
        "subtitle_pipeline" => 10,
        "title_generation" => 5,
        "render" => 25,
        _ => 10,
    }
}

/// Position of a step in the canonical list, if present
pub fn step_index(step: &str) -> Option<usize> {
    ALL_STEPS.iter().position(|s| *s == step)
}

/// Step immediately preceding `step` in the canonical list
pub fn previous_step(step: &str) -> Option<&'static str> {
    match step_index(step) {
        Some(idx) if idx > 0 => Some(ALL_STEPS[idx - 1]),
        _ => None,
    }
}

/// Suffix of the canonical list starting at `target`
pub fn steps_from(target: &str) -> Result<Vec<String>> {
    let idx = step_index(target).ok_or_else(|| {
        OrchestratorError::Replay(format!(
            "Step '{target}' is not in the canonical list. Valid steps: {ALL_STEPS:?}"
        ))
    })?;
    Ok(ALL_STEPS[idx..].iter().map(|s| s.to_string()).collect())
}

/// Estimated replay time in seconds from `target` to the end
pub fn estimate_replay_time(target: &str) -> Result<u64> {
    Ok(steps_from(target)?
        .iter()
        .map(|s| step_cost_estimate(s))
        .sum())
}

/// Root field of a dot-notation path, with any array index stripped
fn root_field(path: &str) -> &str {
    let head = path.split('.').next().unwrap_or(path);
    head.split('[').next().unwrap_or(head)
}

/// Validate a modification set before applying it.
///
/// Paths must be non-empty and their root field must not be blocked.
pub fn validate_modifications(modifications: &HashMap<String, Value>) -> Result<()> {
    for path in modifications.keys() {
        if path.trim().is_empty() {
            return Err(OrchestratorError::InvalidModification(format!(
                "Invalid path: {path:?}"
            )));
        }
        let root = root_field(path);
        if BLOCKED_FIELDS.contains(&root) {
            return Err(OrchestratorError::InvalidModification(format!(
                "Protected field: '{root}' cannot be modified through replay. \
                 Protected fields: {BLOCKED_FIELDS:?}"
            )));
        }
    }
    Ok(())
}

/// One parsed path segment: a key and an optional array index
struct Segment<'a> {
    key: &'a str,
    index: Option<usize>,
}

fn parse_segment<'a>(raw: &'a str, partial: &str) -> Result<Segment<'a>> {
    match raw.split_once('[') {
        None => Ok(Segment { key: raw, index: None }),
        Some((key, rest)) => {
            let digits = rest.trim_end_matches(']');
            let index = digits.parse::<usize>().map_err(|_| {
                OrchestratorError::InvalidModification(format!(
                    "Path '{partial}': invalid array index '{digits}'"
                ))
            })?;
            Ok(Segment { key, index: Some(index) })
        }
    }
}

fn index_into<'a>(
    current: &'a mut Value,
    segment: &Segment<'_>,
    partial: &str,
) -> Result<&'a mut Value> {
    let current_type = type_name(current);
    let object = current.as_object_mut().ok_or_else(|| {
        OrchestratorError::InvalidModification(format!(
            "Path '{partial}': expected an object, found {current_type}"
        ))
    })?;

    match segment.index {
        None => {
            // Auto-create intermediate maps on absent or null nodes
            let entry = object
                .entry(segment.key.to_string())
                .or_insert(Value::Null);
            if entry.is_null() {
                info!(path = %partial, "Creating intermediate field");
                *entry = Value::Object(Map::new());
            }
            Ok(entry)
        }
        Some(index) => {
            let array = object
                .get_mut(segment.key)
                .and_then(Value::as_array_mut)
                .ok_or_else(|| {
                    OrchestratorError::InvalidModification(format!(
                        "Path '{partial}' is not an array"
                    ))
                })?;
            let len = array.len();
            array.get_mut(index).ok_or_else(|| {
                OrchestratorError::InvalidModification(format!(
                    "Path '{partial}': index {index} out of bounds (len {len})"
                ))
            })
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Apply dot-notation modifications to a state JSON object.
///
/// Paths look like `text_styles.default.fill_color` or
/// `tracks.subtitles[0].position.x`; intermediate maps are created on
/// absent nodes, and type mismatches fail with an error naming the partial
/// path navigated so far. Applying a modification set is idempotent.
pub fn apply_modifications(
    state: &mut Value,
    modifications: &HashMap<String, Value>,
) -> Result<()> {
    if modifications.is_empty() {
        return Ok(());
    }
    validate_modifications(modifications)?;

    for (path, value) in modifications {
        let parts: Vec<&str> = path.split('.').collect();
        let mut current = &mut *state;

        for (i, raw) in parts[..parts.len() - 1].iter().enumerate() {
            let partial = parts[..=i].join(".");
            let segment = parse_segment(raw, &partial)?;
            current = index_into(current, &segment, &partial)?;
        }

        let last_raw = parts[parts.len() - 1];
        let segment = parse_segment(last_raw, path)?;
        match segment.index {
            None => {
                let current_type = type_name(current);
                let object = current.as_object_mut().ok_or_else(|| {
                    OrchestratorError::InvalidModification(format!(
                        "Path '{path}': expected an object, found {current_type}"
                    ))
                })?;
                let old = object.insert(segment.key.to_string(), value.clone());
                info!(path = %path, old = ?old, new = %value, "Modification applied");
            }
            Some(index) => {
                let array = current
                    .as_object_mut()
                    .and_then(|o| o.get_mut(segment.key))
                    .and_then(Value::as_array_mut)
                    .ok_or_else(|| {
                        OrchestratorError::InvalidModification(format!(
                            "Path '{path}' is not an array"
                        ))
                    })?;
                let len = array.len();
                let slot = array.get_mut(index).ok_or_else(|| {
                    OrchestratorError::InvalidModification(format!(
                        "Path '{path}': index {index} out of bounds (len {len})"
                    ))
                })?;
                *slot = value.clone();
                info!(path = %path, new = %value, "Modification applied");
            }
        }
    }
    Ok(())
}

/// Keep the two copies of text styles in sync after a modification pass.
///
/// The pipeline holds styles in `text_styles` (set by the template step)
/// and in `template_config._text_styles` (read by PNG generation and the
/// cartela step). A modification to either copy is propagated to the other,
/// otherwise color/font changes would never reach the step that renders.
fn sync_text_styles(state: &mut Value, modifications: &HashMap<String, Value>) {
    let touches_state_styles = modifications.keys().any(|p| p.starts_with("text_styles."));
    let touches_template_styles = modifications
        .keys()
        .any(|p| p.starts_with("template_config._text_styles."));

    if touches_state_styles {
        let styles = state.get("text_styles").cloned();
        if let Some(styles) = styles.filter(|s| !s.is_null()) {
            if let Some(template) = state
                .get_mut("template_config")
                .and_then(Value::as_object_mut)
            {
                template.insert("_text_styles".to_string(), styles);
                info!("Synced text_styles into template_config._text_styles");
            }
        }
    } else if touches_template_styles {
        let styles = state
            .get("template_config")
            .and_then(|t| t.get("_text_styles"))
            .cloned();
        if let Some(styles) = styles.filter(|s| !s.is_null()) {
            if let Some(object) = state.as_object_mut() {
                object.insert("text_styles".to_string(), styles);
                info!("Synced template_config._text_styles into text_styles");
            }
        }
    }
}

/// Replay engine: checkpoint lookup, state reconstruction and async-output
/// recovery.
#[derive(Clone)]
pub struct ReplayEngine {
    state_store: Arc<dyn StateStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<StepRegistry>,
}

impl ReplayEngine {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<StepRegistry>,
    ) -> Self {
        Self {
            state_store,
            checkpoints,
            registry,
        }
    }

    /// Reconstruct the state as it was before `target` executed.
    ///
    /// Loads the checkpoint of the step immediately preceding `target`; if
    /// `target` is the first step, reloads the job's stored state instead
    /// and clears all tracking. Entries at or after `target`'s canonical
    /// position are removed from completed/skipped/timings and the failure
    /// fields are cleared.
    pub async fn reconstruct_state_until(
        &self,
        job_id: &str,
        target: &str,
    ) -> Result<PipelineState> {
        let target_idx = step_index(target).ok_or_else(|| {
            OrchestratorError::Replay(format!(
                "Step '{target}' is not in the canonical list. Valid steps: {ALL_STEPS:?}"
            ))
        })?;

        let state = match previous_step(target) {
            None => {
                info!(job_id = %job_id, target = %target, "Target is the first step, reloading initial job state");
                let state = self
                    .state_store
                    .load(job_id)
                    .await?
                    .ok_or_else(|| OrchestratorError::Replay(format!("Job {job_id} not found")))?;
                state.with_updates(|s| {
                    s.completed_steps.clear();
                    s.skipped_steps.clear();
                    s.step_timings.clear();
                    s.failed_step = None;
                    s.error_message = None;
                })
            }
            Some(previous) => {
                info!(
                    job_id = %job_id,
                    target = %target,
                    previous = %previous,
                    "Loading checkpoint of the preceding step"
                );
                let checkpoint = self.checkpoints.get(job_id, previous).await?.ok_or_else(|| {
                    OrchestratorError::Replay(format!(
                        "No checkpoint found for '{previous}' of job {job_id}; \
                         replay from '{target}' is not possible"
                    ))
                })?;

                let rerun: BTreeSet<&str> = ALL_STEPS[target_idx..].iter().copied().collect();
                PipelineState::from_value(checkpoint.state)?.with_updates(|s| {
                    s.completed_steps.retain(|step| !rerun.contains(step.as_str()));
                    s.skipped_steps.retain(|step| !rerun.contains(step.as_str()));
                    s.step_timings.retain(|step, _| !rerun.contains(step.as_str()));
                    s.failed_step = None;
                    s.error_message = None;
                })
            }
        };

        info!(
            job_id = %job_id,
            completed = ?state.completed_steps,
            "State reconstructed"
        );

        self.merge_async_outputs_for_replay(job_id, target, state).await
    }

    /// Recover async-step outputs that the base checkpoint cannot contain.
    ///
    /// An async step's fields reach the main state only at its await point,
    /// so the checkpoint of the step before the awaiting one lacks them.
    /// For every async dependency of a step-to-rerun that will not itself
    /// re-run, merge its `produces` fields from the `await_<name>`
    /// checkpoint, falling back to the step's own checkpoint.
    async fn merge_async_outputs_for_replay(
        &self,
        job_id: &str,
        target: &str,
        state: PipelineState,
    ) -> Result<PipelineState> {
        let steps_to_run = steps_from(target)?;
        let rerun: BTreeSet<&str> = steps_to_run.iter().map(String::as_str).collect();

        let mut missing_deps: BTreeSet<String> = BTreeSet::new();
        for step in &steps_to_run {
            if let Some(def) = self.registry.get(step) {
                for dep in &def.await_async {
                    if !rerun.contains(dep.as_str()) {
                        missing_deps.insert(dep.clone());
                    }
                }
            }
        }

        if missing_deps.is_empty() {
            return Ok(state);
        }
        info!(job_id = %job_id, deps = ?missing_deps, "Recovering async outputs not re-executed by this replay");

        let mut state_value = state.to_value().map_err(OrchestratorError::Engine)?;
        let mut merged_any = false;

        for async_name in &missing_deps {
            let Some(def) = self.registry.get(async_name) else {
                continue;
            };
            if def.produces.is_empty() {
                info!(step = %async_name, "No produces declared, nothing to recover");
                continue;
            }

            let needs_merge = def.produces.iter().any(|field| {
                state_value
                    .get(field)
                    .map(Value::is_null)
                    .unwrap_or(true)
            });
            if !needs_merge {
                info!(step = %async_name, "Outputs already present in the reconstructed state");
                continue;
            }

            let checkpoint = match self
                .checkpoints
                .get(job_id, &format!("await_{async_name}"))
                .await?
            {
                Some(cp) => Some(cp),
                None => self.checkpoints.get(job_id, async_name).await?,
            };
            let Some(checkpoint) = checkpoint else {
                warn!(
                    step = %async_name,
                    "No checkpoint found; outputs may be missing (optional or never executed?)"
                );
                continue;
            };

            for field in &def.produces {
                if let Some(value) = checkpoint.state.get(field) {
                    if !value.is_null() {
                        state_value[field.as_str()] = value.clone();
                        merged_any = true;
                        info!(step = %async_name, field = %field, "Recovered async output");
                    }
                }
            }
            for extra in EXTRA_MERGE_FIELDS {
                let current_empty = state_value.get(*extra).map(Value::is_null).unwrap_or(true);
                if current_empty {
                    if let Some(value) = checkpoint.state.get(*extra) {
                        if !value.is_null() {
                            state_value[*extra] = value.clone();
                            merged_any = true;
                            info!(step = %async_name, field = %extra, "Recovered async extra");
                        }
                    }
                }
            }
        }

        if merged_any {
            Ok(PipelineState::from_value(state_value).map_err(OrchestratorError::Engine)?)
        } else {
            Ok(state)
        }
    }

    /// Validate, reconstruct, modify and plan a replay in one call.
    ///
    /// Returns the modified state and the steps to run (beginning at
    /// `target`).
    pub async fn prepare_replay(
        &self,
        job_id: &str,
        target: &str,
        modifications: &HashMap<String, Value>,
    ) -> Result<(PipelineState, Vec<String>)> {
        let steps_to_run = steps_from(target)?;
        validate_modifications(modifications)?;

        let state = self.reconstruct_state_until(job_id, target).await?;

        let state = if modifications.is_empty() {
            state
        } else {
            let mut state_value = state.to_value().map_err(OrchestratorError::Engine)?;
            apply_modifications(&mut state_value, modifications)?;
            sync_text_styles(&mut state_value, modifications);
            info!(count = modifications.len(), "Replay modifications applied");
            PipelineState::from_value(state_value).map_err(OrchestratorError::Engine)?
        };

        Ok((state, steps_to_run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mods(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_steps_from_returns_canonical_suffix() {
        let steps = steps_from("generate_pngs").unwrap();
        assert_eq!(steps.first().unwrap(), "generate_pngs");
        assert_eq!(steps.last().unwrap(), "render");

        let all = steps_from("load_template").unwrap();
        assert_eq!(all.len(), ALL_STEPS.len());

        assert!(steps_from("ghost").is_err());
    }

    #[test]
    fn test_estimate_sums_costs() {
        let from_render = estimate_replay_time("render").unwrap();
        assert_eq!(from_render, 25);
        assert!(estimate_replay_time("load_template").unwrap() > from_render);
    }

    #[test]
    fn test_validate_rejects_blocked_roots() {
        for path in [
            "job_id",
            "completed_steps",
            "step_timings.render.duration_ms",
            "video_width",
            "completed_steps[0]",
        ] {
            let err = validate_modifications(&mods(&[(path, json!("x"))])).unwrap_err();
            assert!(
                matches!(err, OrchestratorError::InvalidModification(_)),
                "{path} should be rejected"
            );
        }

        validate_modifications(&mods(&[("text_styles.default.fill_color", json!("#fff"))]))
            .unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        assert!(validate_modifications(&mods(&[("", json!(1))])).is_err());
        assert!(validate_modifications(&mods(&[("   ", json!(1))])).is_err());
    }

    #[test]
    fn test_apply_sets_nested_value() {
        let mut state = json!({
            "text_styles": {"default": {"fill_color": "#FFFFFF", "font_size": 42}}
        });
        apply_modifications(
            &mut state,
            &mods(&[("text_styles.default.fill_color", json!("#0000FF"))]),
        )
        .unwrap();
        assert_eq!(state["text_styles"]["default"]["fill_color"], json!("#0000FF"));
        assert_eq!(state["text_styles"]["default"]["font_size"], json!(42));
    }

    #[test]
    fn test_apply_creates_intermediate_maps() {
        let mut state = json!({"template_config": null});
        apply_modifications(
            &mut state,
            &mods(&[("template_config.palette.primary", json!("#FF0000"))]),
        )
        .unwrap();
        assert_eq!(state["template_config"]["palette"]["primary"], json!("#FF0000"));
    }

    #[test]
    fn test_apply_supports_array_indices() {
        let mut state = json!({
            "subtitle_payload": {"tracks": {"subtitles": [
                {"position": {"x": 0, "y": 10}},
                {"position": {"x": 5, "y": 20}}
            ]}}
        });
        apply_modifications(
            &mut state,
            &mods(&[("subtitle_payload.tracks.subtitles[1].position.x", json!(99))]),
        )
        .unwrap();
        assert_eq!(
            state["subtitle_payload"]["tracks"]["subtitles"][1]["position"]["x"],
            json!(99)
        );
        assert_eq!(
            state["subtitle_payload"]["tracks"]["subtitles"][0]["position"]["x"],
            json!(0)
        );
    }

    #[test]
    fn test_apply_type_mismatch_names_partial_path() {
        let mut state = json!({"transcription_text": "plain string"});
        let err = apply_modifications(
            &mut state,
            &mods(&[("transcription_text.nested.field", json!(1))]),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("transcription_text.nested"), "{message}");
        assert!(message.contains("string"), "{message}");
    }

    #[test]
    fn test_apply_array_index_out_of_bounds() {
        let mut state = json!({"scene_overrides": [{"a": 1}]});
        let err = apply_modifications(&mut state, &mods(&[("scene_overrides[5].a", json!(2))]))
            .unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[test]
    fn test_apply_is_idempotent() {
        let modifications = mods(&[
            ("text_styles.default.fill_color", json!("#0000FF")),
            ("options.fps", json!(60)),
        ]);
        let mut once = json!({"text_styles": {"default": {}}, "options": {}});
        apply_modifications(&mut once, &modifications).unwrap();
        let mut twice = once.clone();
        apply_modifications(&mut twice, &modifications).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sync_text_styles_forward() {
        let mut state = json!({
            "text_styles": {"default": {"fill_color": "#0000FF"}},
            "template_config": {"name": "clean", "_text_styles": {"default": {"fill_color": "#FFF"}}}
        });
        sync_text_styles(
            &mut state,
            &mods(&[("text_styles.default.fill_color", json!("#0000FF"))]),
        );
        assert_eq!(
            state["template_config"]["_text_styles"]["default"]["fill_color"],
            json!("#0000FF")
        );
        assert_eq!(state["template_config"]["name"], json!("clean"));
    }

    #[test]
    fn test_sync_text_styles_reverse() {
        let mut state = json!({
            "text_styles": {"default": {"fill_color": "#FFF"}},
            "template_config": {"_text_styles": {"default": {"fill_color": "#00FF00"}}}
        });
        sync_text_styles(
            &mut state,
            &mods(&[("template_config._text_styles.default.fill_color", json!("#00FF00"))]),
        );
        assert_eq!(state["text_styles"]["default"]["fill_color"], json!("#00FF00"));
    }

    #[test]
    fn test_previous_step_walks_canonical_list() {
        assert_eq!(previous_step("load_template"), None);
        assert_eq!(previous_step("normalize"), Some("load_template"));
        assert_eq!(previous_step("render"), Some("title_generation"));
    }
}
