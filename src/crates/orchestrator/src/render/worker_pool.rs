//! Worker-pool render dispatch with frame-range chunking
//!
//! Splits the total frame count into roughly-equal ranges, one per healthy
//! worker, renders every chunk concurrently, polls each worker until its
//! chunk terminates, then concatenates the ordered chunk files through the
//! shared ffmpeg service and uploads the result to the blob store.
//!
//! The poll loop's 404 handling is the subtle part: before a worker has
//! ever acknowledged a chunk, 404 is normal startup noise (tolerated up to
//! a generous budget); once the worker has answered 200, a 404 means the
//! job disappeared and the chunk fails immediately.

use crate::config::{RenderConfig, WorkerEndpoint};
use crate::render::dispatcher::RenderOutcome;
use crate::render::signing::BlobStore;
use crate::render::url_rewrite::rewrite_payload_to_internal;
use crate::render::worker_client::{
    ConcatApi, HttpConcatClient, HttpWorkerClient, PollReply, WorkerApi, WorkerJobStatus,
};
use crate::render::payload::{HYBRID_MODE_BASE, TEXT_VIDEO_NO_BASE};
use crate::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A contiguous, inclusive frame range assigned to one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub worker_index: usize,
    pub start_frame: i64,
    pub end_frame: i64,
    pub frame_count: i64,
}

/// Poll-loop tuning. Defaults match production; tests shrink the waits.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait before the first poll (job startup)
    pub initial_wait: Duration,
    /// Delay between polls
    pub interval: Duration,
    /// Overall budget per chunk
    pub timeout: Duration,
    /// 404 polls tolerated before the worker ever acknowledged the job
    pub max_preack_not_found: u32,
    /// Consecutive 5xx/transport errors before the chunk fails
    pub max_consecutive_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(10),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
            max_preack_not_found: 150,
            max_consecutive_errors: 5,
        }
    }
}

/// One worker of the chunking pool
pub struct PoolWorker {
    pub endpoint: WorkerEndpoint,
    pub api: Arc<dyn WorkerApi>,
}

struct ChunkSuccess {
    chunk_index: usize,
    worker_name: String,
    chunk_path: Option<String>,
    duration: Duration,
}

struct ChunkFailure {
    chunk_index: usize,
    worker_name: String,
    error: String,
}

/// Distributes one render across the worker pool
pub struct WorkerPoolService {
    workers: Vec<PoolWorker>,
    concat: Arc<dyn ConcatApi>,
    blob_store: Arc<dyn BlobStore>,
    poll: PollConfig,
    max_concurrent_chunks: usize,
    rotation: usize,
}

impl WorkerPoolService {
    pub fn new(
        workers: Vec<PoolWorker>,
        concat: Arc<dyn ConcatApi>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            workers,
            concat,
            blob_store,
            poll: PollConfig::default(),
            max_concurrent_chunks: 6,
            rotation: 0,
        }
    }

    pub fn from_config(config: &RenderConfig, blob_store: Arc<dyn BlobStore>) -> Self {
        let workers = config
            .pool_workers
            .iter()
            .map(|endpoint| PoolWorker {
                endpoint: endpoint.clone(),
                api: Arc::new(HttpWorkerClient::new(endpoint.url.clone())) as Arc<dyn WorkerApi>,
            })
            .collect();
        let mut service = Self::new(
            workers,
            Arc::new(HttpConcatClient::new(config.v_services_url.clone())),
            blob_store,
        );
        service.max_concurrent_chunks = config.max_concurrent_chunks;
        service.rotation = config.worker_rotation;
        service
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_rotation(mut self, rotation: usize) -> Self {
        self.rotation = rotation;
        self
    }

    /// Partition `duration_in_frames` frames across `num_workers`.
    ///
    /// Ranges are contiguous, non-overlapping, differ in size by at most
    /// one frame, and the last range never exceeds `duration_in_frames - 1`
    /// (frames are zero-based).
    pub fn calculate_frame_ranges(duration_in_frames: i64, num_workers: usize) -> Vec<FrameRange> {
        if duration_in_frames <= 0 || num_workers == 0 {
            return Vec::new();
        }
        let max_frame = duration_in_frames - 1;
        let per_worker = duration_in_frames / num_workers as i64;
        let remainder = duration_in_frames % num_workers as i64;

        let mut ranges = Vec::with_capacity(num_workers);
        let mut current = 0i64;
        for i in 0..num_workers {
            let extra = if (i as i64) < remainder { 1 } else { 0 };
            let end = (current + per_worker + extra - 1).min(max_frame);
            if current <= max_frame {
                ranges.push(FrameRange {
                    worker_index: i,
                    start_frame: current,
                    end_frame: end,
                    frame_count: end - current + 1,
                });
            }
            current = end + 1;
            if current > max_frame {
                break;
            }
        }

        info!(
            duration_in_frames,
            max_frame,
            chunks = ranges.len(),
            "Frame ranges computed"
        );
        ranges
    }

    /// Derive the render duration in frames.
    ///
    /// Priority: sum of video-segment durations (authoritative, plus a
    /// 500 ms margin) -> max end-time across any track (plus margin) ->
    /// payload-declared duration (last resort).
    pub fn derive_duration_in_frames(payload: &Value, fps: i64) -> Result<(i64, &'static str)> {
        let tracks = payload.get("tracks").cloned().unwrap_or(json!({}));

        // Priority 1: video segments are the narrative source of truth
        if let Some(segments) = tracks.get("video_segments").and_then(Value::as_array) {
            if !segments.is_empty() {
                let mut total_ms = 0i64;
                for segment in segments {
                    let duration = segment
                        .get("duration")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    // Durations below 1000 are in seconds, larger in ms
                    total_ms += if duration < 1000.0 {
                        (duration * 1000.0) as i64
                    } else {
                        duration as i64
                    };
                }
                if total_ms > 0 {
                    total_ms += 500;
                    let frames = total_ms * fps / 1000;
                    info!(
                        segments = segments.len(),
                        total_ms, frames, "Duration from video segments"
                    );
                    return Ok((frames, "video_segments"));
                }
            }
        }

        // Priority 2: latest end_time on any track
        let mut max_end_ms = 0i64;
        if let Some(track_map) = tracks.as_object() {
            for items in track_map.values().filter_map(Value::as_array) {
                for item in items {
                    let end = item.get("end_time").and_then(Value::as_i64).unwrap_or(0);
                    max_end_ms = max_end_ms.max(end);
                }
            }
        }
        if max_end_ms > 0 {
            let frames = (max_end_ms + 500) * fps / 1000;
            info!(max_end_ms, frames, "Duration from track end times");
            return Ok((frames, "tracks_max_end_time"));
        }

        // Priority 3: whatever the payload declares
        let declared = payload
            .get("duration_in_frames")
            .and_then(Value::as_i64)
            .or_else(|| {
                payload
                    .get("project_settings")
                    .and_then(|p| p.get("video_settings"))
                    .and_then(|v| v.get("duration_in_frames"))
                    .and_then(Value::as_i64)
            })
            .unwrap_or(0);
        if declared > 0 {
            warn!(declared, "Duration fell back to the payload-declared value");
            return Ok((declared, "payload_declared"));
        }

        Err(OrchestratorError::Render(
            "No duration source available: no video segments, empty tracks, \
             no declared duration"
                .to_string(),
        ))
    }

    /// Extract the frame rate from the payload (root, then nested)
    fn extract_fps(payload: &Value) -> i64 {
        payload
            .get("fps")
            .and_then(Value::as_i64)
            .or_else(|| {
                payload
                    .get("project_settings")
                    .and_then(|p| p.get("video_settings"))
                    .and_then(|v| v.get("fps"))
                    .and_then(Value::as_i64)
            })
            .unwrap_or(30)
    }

    /// Build the payload for one chunk.
    ///
    /// Marks the chunk so the worker skips upload and writes to the shared
    /// volume, pins the chunk's frame range, and rewrites every URL to its
    /// in-cluster form so workers never traverse the public edge.
    pub fn prepare_chunk_payload(
        payload: &Value,
        chunk_job_id: &str,
        range: &FrameRange,
        user_id: &str,
        project_id: &str,
    ) -> Value {
        let canvas = payload
            .get("canvas")
            .cloned()
            .unwrap_or(json!({"width": 1080, "height": 1920}));
        let fps = Self::extract_fps(payload);
        let chunk_frames = range.end_frame - range.start_frame + 1;

        let video_url = payload
            .get("video_url")
            .and_then(Value::as_str)
            .unwrap_or("");

        // The subtitle payload may carry an asset id in base_layer; the
        // normalized URL on the payload root is the one workers can fetch.
        let (base_type, base_layer) = if !video_url.is_empty()
            && video_url != TEXT_VIDEO_NO_BASE
            && video_url != HYBRID_MODE_BASE
        {
            ("video".to_string(), json!({"video_base": {"urls": [video_url]}}))
        } else {
            (
                payload
                    .get("base_type")
                    .and_then(Value::as_str)
                    .unwrap_or("solid")
                    .to_string(),
                payload.get("base_layer").cloned().unwrap_or(json!({})),
            )
        };

        let mut chunk_payload = json!({
            "jobId": chunk_job_id,
            "job_id": chunk_job_id,
            "user_id": user_id,
            "project_id": project_id,

            "project_settings": {
                "video_settings": {
                    "width": canvas.get("width").and_then(Value::as_i64).unwrap_or(1080),
                    "height": canvas.get("height").and_then(Value::as_i64).unwrap_or(1920),
                    "fps": fps,
                    "duration_in_frames": chunk_frames,
                }
            },
            "canvas": canvas,
            "fps": fps,
            "duration_in_frames": chunk_frames,
            "video_url": video_url,

            // All tracks travel with every chunk; the worker filters by frame
            "tracks": payload.get("tracks").cloned().unwrap_or(json!({})),
            "base_type": base_type,
            "base_layer": base_layer,
            "render_settings": payload.get("render_settings").cloned().unwrap_or(json!({})),
            "quality_settings": payload.get("quality_settings").cloned().unwrap_or(json!({})),

            "frame_range": {
                "start_frame": range.start_frame,
                "end_frame": range.end_frame,
            },

            "is_chunk": true,
            "skip_upload": true,
            "output_to_shared": true,

            // The orchestrator polls; no webhook for chunks
            "webhook_url": null,
        });

        rewrite_payload_to_internal(&mut chunk_payload);
        chunk_payload
    }

    /// Remove chunk files from earlier renders of this job so polling can
    /// never find a stale artifact. Best effort.
    async fn cleanup_old_chunks(&self, job_id: &str) {
        match self.concat.cleanup_chunks(job_id).await {
            Ok(deleted) if deleted > 0 => {
                info!(job_id = %job_id, deleted, "Removed stale chunks");
            }
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Chunk cleanup failed"),
        }
    }

    /// Indices of workers currently answering their health endpoint
    async fn healthy_worker_indices(&self) -> Vec<usize> {
        let mut healthy = Vec::new();
        for (i, worker) in self.workers.iter().enumerate() {
            if worker.api.health().await {
                healthy.push(i);
            } else {
                warn!(worker = %worker.endpoint.name, "Worker unhealthy");
            }
        }
        info!(
            healthy = healthy.len(),
            total = self.workers.len(),
            "Worker health check"
        );
        healthy
    }

    /// Poll one worker until the chunk job terminates.
    async fn wait_for_chunk_completion(
        &self,
        worker: &PoolWorker,
        job_id: &str,
    ) -> Result<WorkerJobStatus> {
        let start = Instant::now();
        let mut consecutive_errors = 0u32;
        let mut not_found_count = 0u32;
        let mut job_started = false;
        let mut last_status = String::new();

        info!(
            job_id = %job_id,
            worker = %worker.endpoint.name,
            initial_wait_s = self.poll.initial_wait.as_secs(),
            "Waiting for chunk job to start"
        );
        tokio::time::sleep(self.poll.initial_wait).await;

        while start.elapsed() < self.poll.timeout {
            match worker.api.job_status(job_id).await {
                Ok(PollReply::Status(status)) => {
                    consecutive_errors = 0;
                    not_found_count = 0;
                    job_started = true;

                    if status.status != last_status {
                        info!(
                            job_id = %job_id,
                            worker = %worker.endpoint.name,
                            status = %status.status,
                            elapsed_s = start.elapsed().as_secs(),
                            "Chunk status changed"
                        );
                        last_status = status.status.clone();
                    }

                    match status.status.as_str() {
                        "completed" => {
                            info!(
                                job_id = %job_id,
                                elapsed_s = start.elapsed().as_secs(),
                                "Chunk completed"
                            );
                            return Ok(status);
                        }
                        "failed" | "error" => {
                            let message =
                                status.error.unwrap_or_else(|| "Unknown error".to_string());
                            error!(job_id = %job_id, error = %message, "Chunk failed on worker");
                            return Err(OrchestratorError::Render(format!(
                                "Chunk job failed: {message}"
                            )));
                        }
                        // queued, rendering, ... keep polling
                        _ => {}
                    }
                }
                Ok(PollReply::NotFound) => {
                    not_found_count += 1;
                    if job_started {
                        // The worker acknowledged the job earlier; a 404 now
                        // means it lost the job.
                        error!(
                            job_id = %job_id,
                            worker = %worker.endpoint.name,
                            elapsed_s = start.elapsed().as_secs(),
                            "Job disappeared from worker (404 after ack)"
                        );
                        return Err(OrchestratorError::Render(format!(
                            "Job {job_id} disappeared from worker (404)"
                        )));
                    }
                    if not_found_count >= self.poll.max_preack_not_found {
                        error!(
                            job_id = %job_id,
                            polls = not_found_count,
                            "Job never appeared on worker"
                        );
                        return Err(OrchestratorError::Render(format!(
                            "Job {job_id} never started on worker after {} polls",
                            not_found_count
                        )));
                    }
                    if not_found_count % 10 == 1 {
                        info!(
                            job_id = %job_id,
                            worker = %worker.endpoint.name,
                            polls = not_found_count,
                            max = self.poll.max_preack_not_found,
                            "Waiting for job to appear"
                        );
                    }
                }
                Ok(PollReply::ServerError(code)) => {
                    consecutive_errors += 1;
                    warn!(
                        job_id = %job_id,
                        worker = %worker.endpoint.name,
                        code,
                        consecutive = consecutive_errors,
                        "Server error while polling"
                    );
                    if consecutive_errors >= self.poll.max_consecutive_errors {
                        return Err(OrchestratorError::Render(format!(
                            "Worker {} returned {} consecutive 5xx errors",
                            worker.endpoint.name, consecutive_errors
                        )));
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        job_id = %job_id,
                        worker = %worker.endpoint.name,
                        error = %e,
                        consecutive = consecutive_errors,
                        "Connection error while polling"
                    );
                    if consecutive_errors >= self.poll.max_consecutive_errors {
                        return Err(OrchestratorError::Render(format!(
                            "Worker {} unreachable after {} attempts",
                            worker.endpoint.name, consecutive_errors
                        )));
                    }
                }
            }

            tokio::time::sleep(self.poll.interval).await;
        }

        Err(OrchestratorError::Render(format!(
            "Timeout ({}s) waiting for chunk {job_id} on {}",
            start.elapsed().as_secs(),
            worker.endpoint.name
        )))
    }

    /// Submit one chunk and wait for its completion
    async fn render_chunk_on_worker(
        &self,
        worker: &PoolWorker,
        job_id: &str,
        chunk_index: usize,
        range: &FrameRange,
        payload: &Value,
        user_id: &str,
        project_id: &str,
    ) -> std::result::Result<ChunkSuccess, ChunkFailure> {
        let chunk_job_id = format!("{job_id}_chunk_{chunk_index}");
        let start = Instant::now();
        info!(
            chunk = chunk_index,
            worker = %worker.endpoint.name,
            start_frame = range.start_frame,
            end_frame = range.end_frame,
            frames = range.frame_count,
            "Dispatching chunk"
        );

        let chunk_payload =
            Self::prepare_chunk_payload(payload, &chunk_job_id, range, user_id, project_id);

        let fail = |error: String| ChunkFailure {
            chunk_index,
            worker_name: worker.endpoint.name.clone(),
            error,
        };

        if let Err(e) = worker
            .api
            .submit(&chunk_payload, Duration::from_secs(300))
            .await
        {
            error!(chunk = chunk_index, error = %e, "Chunk submission failed");
            return Err(fail(e.to_string()));
        }

        match self.wait_for_chunk_completion(worker, &chunk_job_id).await {
            Ok(status) => {
                let duration = start.elapsed();
                info!(
                    chunk = chunk_index,
                    worker = %worker.endpoint.name,
                    duration_s = duration.as_secs_f64(),
                    "Chunk done"
                );
                Ok(ChunkSuccess {
                    chunk_index,
                    worker_name: worker.endpoint.name.clone(),
                    chunk_path: status.chunk_path(),
                    duration,
                })
            }
            Err(e) => {
                error!(
                    chunk = chunk_index,
                    worker = %worker.endpoint.name,
                    error = %e,
                    "Chunk failed"
                );
                Err(fail(e.to_string()))
            }
        }
    }

    /// Render one job distributed across the pool.
    pub async fn render_distributed(
        &self,
        job_id: &str,
        payload: &Value,
        user_id: &str,
        project_id: &str,
    ) -> Result<RenderOutcome> {
        let total_start = Instant::now();
        info!(job_id = %job_id, "Starting distributed render");

        self.cleanup_old_chunks(job_id).await;

        let healthy = self.healthy_worker_indices().await;
        if healthy.is_empty() {
            error!("No healthy render workers available");
            return Ok(RenderOutcome::failed(job_id, "No render workers available"));
        }

        let fps = Self::extract_fps(payload);
        let (duration_in_frames, source) = match Self::derive_duration_in_frames(payload, fps) {
            Ok(result) => result,
            Err(e) => return Ok(RenderOutcome::failed(job_id, e.to_string())),
        };
        info!(
            duration_in_frames,
            fps,
            source,
            seconds = duration_in_frames as f64 / fps as f64,
            "Render duration resolved"
        );

        let num_workers = healthy.len().min(self.max_concurrent_chunks);
        let ranges = Self::calculate_frame_ranges(duration_in_frames, num_workers);
        if ranges.is_empty() {
            return Ok(RenderOutcome::failed(job_id, "Nothing to render (0 frames)"));
        }

        // Optional rotation: shift which worker takes which chunk index
        let mut assigned: Vec<usize> = healthy.clone();
        if self.rotation > 0 && !assigned.is_empty() {
            let shift = self.rotation % assigned.len();
            assigned.rotate_left(shift);
            info!(rotation = self.rotation, "Worker rotation applied");
        }

        let tasks = ranges.iter().enumerate().map(|(i, range)| {
            let worker = &self.workers[assigned[i % assigned.len()]];
            self.render_chunk_on_worker(worker, job_id, i, range, payload, user_id, project_id)
        });
        let mut results: Vec<std::result::Result<ChunkSuccess, ChunkFailure>> =
            futures::future::join_all(tasks).await;
        results.sort_by_key(|r| match r {
            Ok(success) => success.chunk_index,
            Err(failure) => failure.chunk_index,
        });

        let failures: Vec<&ChunkFailure> =
            results.iter().filter_map(|r| r.as_ref().err()).collect();
        if !failures.is_empty() {
            let detail: Vec<String> = failures
                .iter()
                .map(|f| format!("chunk {} on {}: {}", f.chunk_index, f.worker_name, f.error))
                .collect();
            error!(failed = failures.len(), "Distributed render failed");
            return Ok(RenderOutcome::failed(
                job_id,
                format!("{} chunks failed: {}", failures.len(), detail.join("; ")),
            ));
        }

        let successes: Vec<&ChunkSuccess> =
            results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let chunk_paths: Vec<String> = successes
            .iter()
            .filter_map(|s| s.chunk_path.clone())
            .collect();
        if chunk_paths.len() != successes.len() {
            return Ok(RenderOutcome::failed(
                job_id,
                "Some chunks returned no output path",
            ));
        }

        info!(chunks = chunk_paths.len(), "Concatenating chunks");
        let concat = match self
            .concat
            .concat_chunks(&chunk_paths, &format!("{job_id}_final.mp4"), job_id)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                return Ok(RenderOutcome::failed(
                    job_id,
                    format!("Concatenation failed: {e}"),
                ))
            }
        };

        // Upload the concatenated file; on failure fall back to the concat
        // service URL so the job can still complete.
        let mut output_url = concat.output_url.clone();
        if let Some(source_url) = &concat.output_url {
            let destination =
                format!("users/{user_id}/projects/{project_id}/renders/{job_id}_final.mp4");
            match self
                .blob_store
                .upload_from_url(source_url, &destination, "video/mp4")
                .await
            {
                Ok(url) => {
                    info!(url = %url, "Final render uploaded");
                    output_url = Some(url);
                }
                Err(e) => {
                    warn!(error = %e, "Blob upload failed, using concat service URL");
                }
            }
        }

        let Some(output_url) = output_url else {
            return Ok(RenderOutcome::failed(job_id, "Concat returned no output URL"));
        };

        let sequential: Duration = successes.iter().map(|s| s.duration).sum();
        let total = total_start.elapsed();
        info!(
            total_s = total.as_secs_f64(),
            sequential_estimate_s = sequential.as_secs_f64(),
            speedup = sequential.as_secs_f64() / total.as_secs_f64().max(0.001),
            workers_used = num_workers,
            "Distributed render complete"
        );

        let mut outcome =
            RenderOutcome::completed(job_id, output_url).with_workers_used(num_workers);
        if let Some(path) = concat.output_path {
            outcome = outcome.with_output_path(path);
        }
        Ok(outcome)
    }
}
