//! Pipeline engine
//!
//! Executes a requested sequence of steps for a job: resolves order through
//! the registry, runs each step with retry and a per-attempt timeout,
//! persists the state after every step (crash recovery), writes best-effort
//! checkpoints for replay, emits progress events, and drives fire-and-wait
//! async subflows.
//!
//! The engine decides nothing about WHICH steps run; that is the driver's
//! job (auto-runner presets or an agent selecting steps by name).

use crate::events::{EventSink, LogEventSink};
use crate::registry::{StepDefinition, StepRegistry};
use crate::state::{PipelineState, StepResult, StepTiming};
use crate::store::{FailureNotifier, JobStatus, NoopNotifier, StateStore};
use crate::{EngineError, Result};
use pipeline_checkpoint::{CheckpointStore, StepCheckpoint};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Fields merged from async steps even when absent from `produces`.
/// Known side-effects of the matting subflow.
const EXTRA_MERGE_FIELDS: &[&str] = &["matted_video_url"];

/// Timeout applied when awaiting an async step whose definition is gone
const DEFAULT_AWAIT_TIMEOUT_S: u64 = 600;

type InFlight = HashMap<String, JoinHandle<Result<PipelineState>>>;

/// The pipeline engine. Cheap to clone; clones share the same stores.
#[derive(Clone)]
pub struct PipelineEngine {
    registry: Arc<StepRegistry>,
    state_store: Arc<dyn StateStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<dyn EventSink>,
    notifier: Arc<dyn FailureNotifier>,
}

impl PipelineEngine {
    pub fn new(
        registry: Arc<StepRegistry>,
        state_store: Arc<dyn StateStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            registry,
            state_store,
            checkpoints,
            events: Arc::new(LogEventSink),
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Replace the event sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the failure notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Registry backing this engine
    pub fn registry(&self) -> &Arc<StepRegistry> {
        &self.registry
    }

    /// Execute a list of steps in dependency order.
    ///
    /// Loads the state from the store unless `initial_state` is given.
    /// Stops after `stop_after` (job transitions to `awaiting_review`);
    /// otherwise, when the final state carries an output video URL, the job
    /// is marked completed.
    pub async fn run(
        &self,
        job_id: &str,
        steps: &[String],
        initial_state: Option<PipelineState>,
        stop_after: Option<&str>,
    ) -> Result<PipelineState> {
        let mut state = match initial_state {
            Some(state) => state,
            None => self
                .state_store
                .load(job_id)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?,
        };

        let ordered = self.registry.resolve_order(steps);
        info!(
            job_id = %job_id,
            steps = ?ordered,
            already_completed = ?state.completed_steps,
            "Starting pipeline"
        );

        self.state_store
            .update_job_status(job_id, JobStatus::Processing, None)
            .await?;
        self.events.job_start(job_id, ordered.len()).await;

        let pipeline_start = Instant::now();
        let mut in_flight: InFlight = HashMap::new();
        let mut stopped_for_review = false;

        for step_name in &ordered {
            let Some(def) = self.registry.get(step_name) else {
                warn!(step = %step_name, "Step vanished from registry, skipping");
                continue;
            };

            if state.completed_steps.iter().any(|s| s == step_name) {
                info!(step = %step_name, "Already completed, skipping");
                continue;
            }
            if state.skipped_steps.iter().any(|s| s == step_name) {
                info!(step = %step_name, "Previously skipped, skipping");
                continue;
            }

            // AWAIT: merge results of async steps this one depends on
            for async_name in &def.await_async {
                if let Some(handle) = in_flight.remove(async_name) {
                    match self.await_async_step(job_id, async_name, handle, state.clone()).await {
                        Ok(next) => state = next,
                        Err(e) => return Err(self.fail_job(job_id, &state, async_name, e).await),
                    }
                }
            }

            // FIRE: async steps run in the background, the sequence continues
            if def.async_mode {
                self.fire_async_step(job_id, def, &state, &mut in_flight);
                continue;
            }

            match self.execute_step(job_id, def, state.clone(), json!({})).await {
                Ok(next) => state = next,
                Err(e) => return Err(self.fail_job(job_id, &state, step_name, e).await),
            }

            if stop_after == Some(step_name.as_str()) {
                info!(step = %step_name, "Stopping for review (stop_after)");
                self.state_store
                    .update_job_status(job_id, JobStatus::AwaitingReview, None)
                    .await?;
                stopped_for_review = true;
                break;
            }
        }

        // Await every still-in-flight async step before finishing
        let pending: Vec<String> = in_flight.keys().cloned().collect();
        for async_name in pending {
            if let Some(handle) = in_flight.remove(&async_name) {
                match self.await_async_step(job_id, &async_name, handle, state.clone()).await {
                    Ok(next) => state = next,
                    Err(e) => return Err(self.fail_job(job_id, &state, &async_name, e).await),
                }
            }
        }

        let total_ms = pipeline_start.elapsed().as_millis() as i64;
        info!(job_id = %job_id, total_ms, "Pipeline finished");

        if !stopped_for_review {
            if let Some(output_url) = state.output_video_url.clone() {
                self.state_store
                    .update_job_status(job_id, JobStatus::Completed, None)
                    .await?;
                self.events.job_complete(job_id, &output_url, total_ms).await;
            }
        }

        Ok(state)
    }

    /// Execute exactly one step, returning a [`StepResult`] for external
    /// drivers. Never returns an error; failures are folded into the result.
    pub async fn run_step(&self, job_id: &str, step_name: &str, params: Value) -> StepResult {
        let state = match self.state_store.load(job_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return StepResult::failure(step_name, format!("Job {job_id} not found")),
            Err(e) => return StepResult::failure(step_name, e.to_string()),
        };

        let Some(def) = self.registry.get(step_name) else {
            return StepResult::failure(step_name, format!("Step '{step_name}' not registered"));
        };

        let started = Instant::now();
        match self.execute_step(job_id, def, state.clone(), params).await {
            Ok(next) => StepResult::success(
                step_name,
                started.elapsed().as_millis() as i64,
                next.summary(),
            ),
            Err(e) => {
                let mut result = StepResult::failure(step_name, e.to_string());
                result.state_summary = Some(state.summary());
                result
            }
        }
    }

    /// Current state of a job
    pub async fn get_state(&self, job_id: &str) -> Result<Option<PipelineState>> {
        self.state_store.load(job_id).await
    }

    /// Compact debug projection of a job's tracking fields
    pub async fn get_debug_info(&self, job_id: &str) -> Result<Value> {
        let Some(state) = self.state_store.load(job_id).await? else {
            return Ok(json!({"error": format!("Job {job_id} not found")}));
        };

        let populated: Vec<String> = state
            .to_value()?
            .as_object()
            .map(|map| {
                map.iter()
                    .filter(|(_, v)| match v {
                        Value::Null => false,
                        Value::Array(a) => !a.is_empty(),
                        Value::Object(o) => !o.is_empty(),
                        Value::String(s) => !s.is_empty(),
                        _ => true,
                    })
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();

        Ok(json!({
            "job_id": job_id,
            "completed_steps": state.completed_steps,
            "skipped_steps": state.skipped_steps,
            "failed_step": state.failed_step,
            "error_message": state.error_message,
            "step_timings": state.step_timings,
            "template_id": state.template_id,
            "phase1_source": state.phase1_source,
            "total_duration_ms": state.total_duration_ms,
            "has_pngs": state.png_results.is_some(),
            "has_transcription": state.transcription_text.is_some(),
            "video_dimensions": format!("{}x{}", state.video_width, state.video_height),
            "engine_version": state.engine_version,
            "state_keys_with_data": populated,
        }))
    }

    /// Run one step with retry, timeout, persistence and events.
    async fn execute_step(
        &self,
        job_id: &str,
        def: Arc<StepDefinition>,
        state: PipelineState,
        params: Value,
    ) -> Result<PipelineState> {
        let step_name = def.name.clone();
        let event_name = def.event_name();
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();

        self.events.step_start(job_id, &event_name).await;
        info!(
            step = %step_name,
            category = ?def.category,
            max_retries = def.max_retries,
            "Step starting"
        );

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                Duration::from_secs(def.timeout_s),
                (def.handler)(state.clone(), params.clone()),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(produced)) => {
                    let new_state = match produced {
                        Some(new_state) => new_state,
                        None => {
                            warn!(step = %step_name, "Step returned no state, keeping previous");
                            state.clone()
                        }
                    };

                    let duration_ms = started.elapsed().as_millis() as i64;
                    let timing = StepTiming {
                        started_at: Some(started_at.clone()),
                        duration_ms,
                        attempt: attempt + 1,
                        error: None,
                        skipped: false,
                    };
                    let next = new_state.with_updates(|s| {
                        // Tracking always derives from the pre-step state so a
                        // handler cannot drop history.
                        s.completed_steps = state.completed_steps.clone();
                        s.step_timings = state.step_timings.clone();
                        s.mark_completed(&step_name);
                        s.step_timings.insert(step_name.clone(), timing);
                    });

                    self.state_store.save(job_id, &next, &step_name).await?;
                    self.write_checkpoint(job_id, &step_name, &next, duration_ms, attempt + 1)
                        .await;

                    self.events
                        .step_complete(job_id, &event_name, duration_ms)
                        .await;
                    info!(
                        step = %step_name,
                        duration_ms,
                        attempt = attempt + 1,
                        "Step complete"
                    );
                    return Ok(next);
                }
                Ok(Err(e)) => e,
                Err(_) => EngineError::StepTimeout {
                    step: step_name.clone(),
                    timeout_s: def.timeout_s,
                },
            };

            if attempt < def.max_retries && def.retryable {
                let wait = 2u64.pow(attempt);
                warn!(
                    step = %step_name,
                    attempt = attempt + 1,
                    error = %failure,
                    retry_in_s = wait,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                attempt += 1;
                continue;
            }

            // Terminal failure
            let duration_ms = started.elapsed().as_millis() as i64;
            error!(
                step = %step_name,
                attempts = attempt + 1,
                error = %failure,
                "Step failed terminally"
            );
            self.events
                .step_error(job_id, &event_name, &failure.to_string())
                .await;

            if def.optional {
                info!(step = %step_name, "Optional step, continuing pipeline");
                let timing = StepTiming {
                    started_at: Some(started_at),
                    duration_ms,
                    attempt: attempt + 1,
                    error: Some(failure.to_string()),
                    skipped: true,
                };
                let next = state.with_updates(|s| {
                    s.mark_skipped(&step_name);
                    s.step_timings.insert(step_name.clone(), timing);
                });
                self.state_store.save(job_id, &next, &step_name).await?;
                return Ok(next);
            }

            return Err(failure);
        }
    }

    /// Dispatch an async step onto a background task with a snapshot of the
    /// current state. The main sequence continues immediately.
    fn fire_async_step(
        &self,
        job_id: &str,
        def: Arc<StepDefinition>,
        state: &PipelineState,
        in_flight: &mut InFlight,
    ) {
        let step_name = def.name.clone();
        info!(step = %step_name, "Fired async, pipeline continues without waiting");

        let engine = self.clone();
        let job = job_id.to_string();
        let snapshot = state.clone();
        let handle = tokio::spawn(async move {
            engine.execute_step(&job, def, snapshot, json!({})).await
        });
        in_flight.insert(step_name, handle);
    }

    /// Wait for an async step and merge its results into the current state.
    ///
    /// Only the fields the step declares in `produces` (plus the known
    /// extras) are copied; tracking is merged unconditionally. The merged
    /// state is persisted and checkpointed as `await_<name>` so replays
    /// starting at the awaiting step can recover the async outputs.
    async fn await_async_step(
        &self,
        job_id: &str,
        async_name: &str,
        mut handle: JoinHandle<Result<PipelineState>>,
        current: PipelineState,
    ) -> Result<PipelineState> {
        let def = self.registry.get(async_name);
        let timeout_s = def
            .as_ref()
            .map(|d| d.timeout_s)
            .unwrap_or(DEFAULT_AWAIT_TIMEOUT_S);
        let optional = def.as_ref().map(|d| d.optional).unwrap_or(false);

        if handle.is_finished() {
            info!(step = %async_name, "Async step already finished, collecting result");
        } else {
            info!(step = %async_name, timeout_s, "Waiting for async step");
        }

        let outcome = match tokio::time::timeout(Duration::from_secs(timeout_s), &mut handle).await
        {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!(step = %async_name, error = %join_err, "Async task died");
                Err(EngineError::AsyncAborted(async_name.to_string()))
            }
            Err(_) => {
                handle.abort();
                Err(EngineError::StepTimeout {
                    step: async_name.to_string(),
                    timeout_s,
                })
            }
        };

        let async_state = match outcome {
            Ok(state) => state,
            Err(e) if optional => {
                warn!(step = %async_name, error = %e, "Async step failed (optional), marking skipped");
                return Ok(current.with_updates(|s| s.mark_skipped(async_name)));
            }
            Err(e) => {
                error!(step = %async_name, error = %e, "Async step failed (required)");
                return Err(e);
            }
        };

        let async_value = async_state.to_value()?;
        let mut merged_value = current.to_value()?;
        let mut merged_fields: Vec<&str> = Vec::new();

        if let Some(def) = &def {
            for field in &def.produces {
                if let Some(value) = async_value.get(field) {
                    if !value.is_null() {
                        merged_value[field.as_str()] = value.clone();
                        merged_fields.push(field);
                    }
                }
            }
        }
        for extra in EXTRA_MERGE_FIELDS {
            let already = merged_fields.iter().any(|f| f == extra);
            if !already {
                if let Some(value) = async_value.get(*extra) {
                    let current_empty = merged_value
                        .get(*extra)
                        .map(Value::is_null)
                        .unwrap_or(true);
                    if !value.is_null() && current_empty {
                        merged_value[*extra] = value.clone();
                        merged_fields.push(extra);
                    }
                }
            }
        }

        let mut merged = PipelineState::from_value(merged_value)?;
        merged.mark_completed(async_name);
        if let Some(timing) = async_state.step_timings.get(async_name) {
            merged
                .step_timings
                .insert(async_name.to_string(), timing.clone());
        }

        info!(step = %async_name, fields = ?merged_fields, "Async merge complete");

        let merge_name = format!("await_{async_name}");
        self.state_store.save(job_id, &merged, &merge_name).await?;
        self.write_checkpoint(job_id, &merge_name, &merged, 0, 1).await;

        Ok(merged)
    }

    /// Best-effort checkpoint write; failures are logged, never raised.
    async fn write_checkpoint(
        &self,
        job_id: &str,
        step_name: &str,
        state: &PipelineState,
        duration_ms: i64,
        attempt: u32,
    ) {
        let state_value = match state.to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(step = %step_name, error = %e, "Checkpoint serialization failed");
                return;
            }
        };
        let checkpoint =
            StepCheckpoint::new(job_id, step_name, state_value, duration_ms, attempt);
        if let Err(e) = self.checkpoints.put(checkpoint).await {
            warn!(step = %step_name, error = %e, "Checkpoint write failed");
        }
    }

    /// Terminal failure handling: annotate the state, persist, flip the job
    /// status, emit the error event and fire the best-effort notifier.
    async fn fail_job(
        &self,
        job_id: &str,
        state: &PipelineState,
        step_name: &str,
        err: EngineError,
    ) -> EngineError {
        error!(job_id = %job_id, step = %step_name, error = %err, "Pipeline failed");

        let message = err.to_string();
        let annotated = state.with_updates(|s| {
            s.failed_step = Some(step_name.to_string());
            s.error_message = Some(message.clone());
        });

        if let Err(e) = self.state_store.save(job_id, &annotated, step_name).await {
            error!(error = %e, "Could not persist failure state");
        }
        if let Err(e) = self
            .state_store
            .update_job_status(job_id, JobStatus::Failed, Some(&message))
            .await
        {
            error!(error = %e, "Could not update job status to failed");
        }

        self.events.job_error(job_id, &message, Some(step_name)).await;

        let project_id = (!annotated.project_id.is_empty()).then_some(annotated.project_id.as_str());
        let user_id = (!annotated.user_id.is_empty()).then_some(annotated.user_id.as_str());
        self.notifier
            .notify_failure(job_id, step_name, &message, project_id, user_id)
            .await;

        err
    }
}
