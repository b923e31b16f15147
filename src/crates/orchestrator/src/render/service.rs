//! Single-backend render dispatch
//!
//! Submits a full render payload to one external worker. Two flavors:
//! synchronous workers block until the artifact exists and return its URL;
//! acknowledging workers return within seconds and deliver the final
//! artifact later through the webhook callback.

use crate::config::RenderConfig;
use crate::db::connection::DatabasePool;
use crate::db::repositories::DebugLogRepository;
use crate::render::dispatcher::RenderOutcome;
use crate::render::payload::build_render_payload;
use crate::render::signing::{refresh_signed_urls, BlobStore};
use crate::render::worker_client::{HttpWorkerClient, PollReply, WorkerApi};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How the configured worker completes jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFlavor {
    /// The response carries the final artifact URL (timeout 600 s)
    Synchronous,
    /// The response is only an acknowledgement; the webhook finishes the
    /// job later (timeout 5 s)
    Acknowledged,
}

impl WorkerFlavor {
    fn submit_timeout(&self) -> Duration {
        match self {
            WorkerFlavor::Synchronous => Duration::from_secs(600),
            WorkerFlavor::Acknowledged => Duration::from_secs(5),
        }
    }
}

/// Dispatch to one external render worker
pub struct RenderService {
    worker: Arc<dyn WorkerApi>,
    flavor: WorkerFlavor,
    pool: DatabasePool,
    blob_store: Arc<dyn BlobStore>,
    webhook_url: String,
    use_structured_paths: bool,
}

impl RenderService {
    pub fn new(
        worker: Arc<dyn WorkerApi>,
        flavor: WorkerFlavor,
        pool: DatabasePool,
        blob_store: Arc<dyn BlobStore>,
        webhook_url: impl Into<String>,
        use_structured_paths: bool,
    ) -> Self {
        Self {
            worker,
            flavor,
            pool,
            blob_store,
            webhook_url: webhook_url.into(),
            use_structured_paths,
        }
    }

    pub fn from_config(
        config: &RenderConfig,
        pool: DatabasePool,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self::new(
            Arc::new(HttpWorkerClient::new(config.editor_url.clone())),
            WorkerFlavor::Acknowledged,
            pool,
            blob_store,
            config.webhook_url(),
            config.use_structured_paths,
        )
    }

    pub fn with_flavor(mut self, flavor: WorkerFlavor) -> Self {
        self.flavor = flavor;
        self
    }

    /// Send a render job to the worker.
    ///
    /// Builds the worker payload, renews every embedded signed URL, records
    /// the dispatched document in the debug log (best effort), then submits
    /// with the flavor's timeout.
    pub async fn submit_render_job(
        &self,
        job_id: &str,
        payload: &Value,
        user_id: &str,
        project_id: &str,
        template_id: Option<&str>,
    ) -> Result<RenderOutcome> {
        info!(job_id = %job_id, "Submitting render job");

        let mut render_payload = build_render_payload(
            &self.pool,
            self.use_structured_paths,
            job_id,
            payload,
            user_id,
            project_id,
            template_id,
            &self.webhook_url,
        )
        .await?;

        refresh_signed_urls(&self.blob_store, &mut render_payload).await;

        // Keep the dispatched document for replay/diagnosis tooling
        match serde_json::to_string(&render_payload) {
            Ok(text) => {
                if let Err(e) =
                    DebugLogRepository::insert(&self.pool, job_id, "render_service", "input", &text)
                        .await
                {
                    warn!(error = %e, "Could not log render payload");
                }
            }
            Err(e) => warn!(error = %e, "Could not serialize render payload for logging"),
        }

        let response = match self
            .worker
            .submit(&render_payload, self.flavor.submit_timeout())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Render submission failed");
                return Ok(RenderOutcome::failed(job_id, e.to_string()));
            }
        };

        match self.flavor {
            WorkerFlavor::Synchronous => {
                let success = response
                    .get("success")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                if !success {
                    let message = response
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown worker error");
                    error!(job_id = %job_id, error = %message, "Synchronous render failed");
                    return Ok(RenderOutcome::failed(job_id, message));
                }

                let output_url = response
                    .get("b2_url")
                    .or_else(|| response.get("video_url"))
                    .or_else(|| response.get("output_url"))
                    .and_then(Value::as_str);
                match output_url {
                    Some(url) => {
                        info!(job_id = %job_id, url = %url, "Synchronous render complete");
                        let mut outcome = RenderOutcome::completed(job_id, url);
                        if let Some(path) =
                            response.get("output_path").and_then(Value::as_str)
                        {
                            outcome = outcome.with_output_path(path);
                        }
                        Ok(outcome)
                    }
                    None => Ok(RenderOutcome::failed(
                        job_id,
                        "Worker reported success without an output URL",
                    )),
                }
            }
            WorkerFlavor::Acknowledged => {
                info!(
                    job_id = %job_id,
                    webhook = %self.webhook_url,
                    "Render accepted, awaiting webhook"
                );
                Ok(RenderOutcome::processing(
                    job_id,
                    "Job accepted - final result arrives via webhook",
                ))
            }
        }
    }

    /// Ask the worker for a job's status document
    pub async fn check_job_status(&self, job_id: &str) -> Result<Value> {
        match self.worker.job_status(job_id).await? {
            PollReply::Status(status) => Ok(serde_json::to_value(status)?),
            PollReply::NotFound => Ok(serde_json::json!({
                "status": "not_found",
                "job_id": job_id,
            })),
            PollReply::ServerError(code) => Ok(serde_json::json!({
                "status": "error",
                "error": format!("Status {code}"),
            })),
        }
    }

    /// Probe the worker's health endpoint
    pub async fn health_check(&self) -> bool {
        self.worker.health().await
    }
}
