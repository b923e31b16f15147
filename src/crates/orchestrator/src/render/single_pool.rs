//! Single-job worker pool
//!
//! Unlike the chunking pool, this pool routes whole jobs: each worker
//! renders one complete video by itself. Selection is round-robin,
//! preferring idle healthy workers and falling back to the next worker
//! when everything is busy (the worker's internal queue absorbs the job).
//! Workers are released explicitly when the completion webhook arrives.

use crate::config::{RenderConfig, WorkerEndpoint};
use crate::db::connection::DatabasePool;
use crate::render::dispatcher::RenderOutcome;
use crate::render::payload::build_render_payload;
use crate::render::signing::{refresh_signed_urls, BlobStore};
use crate::render::worker_client::{HttpWorkerClient, WorkerApi};
use crate::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

struct SingleWorker {
    endpoint: WorkerEndpoint,
    api: Arc<dyn WorkerApi>,
    is_busy: bool,
    current_job_id: Option<String>,
    is_healthy: bool,
}

struct PoolState {
    workers: Vec<SingleWorker>,
    round_robin_index: usize,
}

/// Round-robin pool of whole-job workers
pub struct SinglePoolService {
    state: Mutex<PoolState>,
    pool: DatabasePool,
    blob_store: Arc<dyn BlobStore>,
    webhook_url: String,
    use_structured_paths: bool,
}

impl SinglePoolService {
    pub fn new(
        workers: Vec<(WorkerEndpoint, Arc<dyn WorkerApi>)>,
        pool: DatabasePool,
        blob_store: Arc<dyn BlobStore>,
        webhook_url: impl Into<String>,
        use_structured_paths: bool,
    ) -> Self {
        let workers = workers
            .into_iter()
            .map(|(endpoint, api)| SingleWorker {
                endpoint,
                api,
                is_busy: false,
                current_job_id: None,
                is_healthy: true,
            })
            .collect();
        Self {
            state: Mutex::new(PoolState {
                workers,
                round_robin_index: 0,
            }),
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
        let workers = config
            .single_workers
            .iter()
            .map(|endpoint| {
                (
                    endpoint.clone(),
                    Arc::new(HttpWorkerClient::new(endpoint.url.clone())) as Arc<dyn WorkerApi>,
                )
            })
            .collect();
        Self::new(
            workers,
            pool,
            blob_store,
            config.webhook_url(),
            config.use_structured_paths,
        )
    }

    /// Pick the next worker round-robin: first idle healthy worker, or when
    /// all are busy, simply the next one in rotation. Marks it busy.
    fn claim_next_worker(&self, job_id: &str) -> (usize, String, Arc<dyn WorkerApi>) {
        let mut state = self.state.lock();
        let count = state.workers.len();

        let mut chosen = None;
        for _ in 0..count {
            let index = state.round_robin_index;
            state.round_robin_index = (state.round_robin_index + 1) % count;
            let worker = &state.workers[index];
            if !worker.is_busy && worker.is_healthy {
                chosen = Some(index);
                break;
            }
        }
        let index = chosen.unwrap_or_else(|| {
            // Everything busy: hand the job to the next worker anyway and
            // let its internal queue hold it.
            let index = state.round_robin_index;
            state.round_robin_index = (state.round_robin_index + 1) % count;
            index
        });

        let worker = &mut state.workers[index];
        worker.is_busy = true;
        worker.current_job_id = Some(job_id.to_string());
        (index, worker.endpoint.name.clone(), worker.api.clone())
    }

    /// Claim a specific idle backup worker, if one exists
    fn claim_idle_backup(&self, job_id: &str, exclude: usize) -> Option<(usize, String, Arc<dyn WorkerApi>)> {
        let mut state = self.state.lock();
        let index = state
            .workers
            .iter()
            .enumerate()
            .find(|(i, w)| *i != exclude && !w.is_busy && w.is_healthy)
            .map(|(i, _)| i)?;
        let worker = &mut state.workers[index];
        worker.is_busy = true;
        worker.current_job_id = Some(job_id.to_string());
        Some((index, worker.endpoint.name.clone(), worker.api.clone()))
    }

    fn release_worker(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(worker) = state.workers.get_mut(index) {
            worker.is_busy = false;
            worker.current_job_id = None;
        }
    }

    async fn submit_to(
        &self,
        index: usize,
        worker_name: &str,
        api: Arc<dyn WorkerApi>,
        job_id: &str,
        render_payload: &Value,
    ) -> Result<RenderOutcome> {
        let mut payload = render_payload.clone();
        payload["worker_name"] = json!(worker_name);

        match api.submit(&payload, Duration::from_secs(30)).await {
            Ok(_) => {
                info!(job_id = %job_id, worker = %worker_name, "Job accepted by single worker");
                Ok(RenderOutcome::processing(
                    job_id,
                    format!("Accepted by {worker_name}"),
                ))
            }
            Err(e) => {
                warn!(job_id = %job_id, worker = %worker_name, error = %e, "Single worker rejected job");
                self.release_worker(index);
                Err(e)
            }
        }
    }

    /// Submit one whole job to the pool.
    pub async fn submit_render_job(
        &self,
        job_id: &str,
        payload: &Value,
        user_id: &str,
        project_id: &str,
        template_id: Option<&str>,
    ) -> Result<RenderOutcome> {
        info!(job_id = %job_id, "Submitting to single-worker pool");
        if self.state.lock().workers.is_empty() {
            return Ok(RenderOutcome::failed(job_id, "Single-worker pool is empty"));
        }

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

        let (index, worker_name, api) = self.claim_next_worker(job_id);
        info!(worker = %worker_name, "Worker selected");

        match self
            .submit_to(index, &worker_name, api, job_id, &render_payload)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(first_error) => {
                // Retry once on an idle backup worker
                if let Some((backup_index, backup_name, backup_api)) =
                    self.claim_idle_backup(job_id, index)
                {
                    info!(worker = %backup_name, "Retrying on backup worker");
                    match self
                        .submit_to(backup_index, &backup_name, backup_api, job_id, &render_payload)
                        .await
                    {
                        Ok(outcome) => Ok(outcome),
                        Err(e) => Ok(RenderOutcome::failed(job_id, e.to_string())),
                    }
                } else {
                    Ok(RenderOutcome::failed(job_id, first_error.to_string()))
                }
            }
        }
    }

    /// Release whichever worker is rendering `job_id` (webhook arrival)
    pub fn mark_job_complete(&self, job_id: &str) {
        let mut state = self.state.lock();
        for worker in &mut state.workers {
            if worker.current_job_id.as_deref() == Some(job_id) {
                info!(worker = %worker.endpoint.name, job_id = %job_id, "Worker released");
                worker.is_busy = false;
                worker.current_job_id = None;
                return;
            }
        }
    }

    /// Probe every worker's health endpoint and update the flags
    pub async fn check_all_health(&self) -> Vec<(String, bool)> {
        let probes: Vec<(usize, String, Arc<dyn WorkerApi>)> = {
            let state = self.state.lock();
            state
                .workers
                .iter()
                .enumerate()
                .map(|(i, w)| (i, w.endpoint.name.clone(), w.api.clone()))
                .collect()
        };

        let mut results = Vec::with_capacity(probes.len());
        for (index, name, api) in probes {
            let healthy = api.health().await;
            if !healthy {
                warn!(worker = %name, "Health check failed");
            }
            self.state.lock().workers[index].is_healthy = healthy;
            results.push((name, healthy));
        }
        results
    }

    /// Pool snapshot for introspection
    pub fn get_status(&self) -> Value {
        let state = self.state.lock();
        json!({
            "total_workers": state.workers.len(),
            "busy_workers": state.workers.iter().filter(|w| w.is_busy).count(),
            "healthy_workers": state.workers.iter().filter(|w| w.is_healthy).count(),
            "workers": state.workers.iter().map(|w| json!({
                "id": w.endpoint.id,
                "name": w.endpoint.name,
                "url": w.endpoint.url,
                "is_busy": w.is_busy,
                "current_job": w.current_job_id,
                "is_healthy": w.is_healthy,
            })).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;
    use crate::render::worker_client::PollReply;
    use async_trait::async_trait;

    struct FlakyWorker {
        accept: bool,
        jobs: Mutex<Vec<String>>,
    }

    impl FlakyWorker {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                jobs: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl crate::render::worker_client::WorkerApi for FlakyWorker {
        async fn health(&self) -> bool {
            true
        }

        async fn submit(&self, payload: &Value, _timeout: Duration) -> crate::Result<Value> {
            if !self.accept {
                return Err(crate::OrchestratorError::Render("connection refused".into()));
            }
            self.jobs
                .lock()
                .push(payload["job_id"].as_str().unwrap_or("").to_string());
            Ok(json!({"status": "queued"}))
        }

        async fn job_status(&self, _job_id: &str) -> crate::Result<PollReply> {
            Ok(PollReply::NotFound)
        }
    }

    struct NoopStore;

    #[async_trait]
    impl BlobStore for NoopStore {
        async fn generate_signed_url(&self, path: &str, _secs: u64) -> crate::Result<String> {
            Ok(format!("https://cdn.example/{path}"))
        }

        async fn upload_from_url(&self, _s: &str, d: &str, _c: &str) -> crate::Result<String> {
            Ok(format!("https://cdn.example/{d}"))
        }
    }

    async fn pool_of(workers: Vec<Arc<FlakyWorker>>) -> SinglePoolService {
        let conn = DatabaseConnection::with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        conn.run_migrations().await.unwrap();

        let endpoints = workers
            .into_iter()
            .enumerate()
            .map(|(i, api)| {
                (
                    WorkerEndpoint::new(
                        format!("single-{}", i + 1),
                        format!("v-editor-single-{}", i + 1),
                        format!("http://v-editor-single-{}:5010", i + 1),
                    ),
                    api as Arc<dyn crate::render::worker_client::WorkerApi>,
                )
            })
            .collect();
        SinglePoolService::new(
            endpoints,
            conn.pool().clone(),
            Arc::new(NoopStore),
            "https://api.vinicius.ai/api/webhook/render-complete",
            true,
        )
    }

    #[tokio::test]
    async fn test_round_robin_prefers_idle_workers() {
        let w1 = FlakyWorker::new(true);
        let w2 = FlakyWorker::new(true);
        let pool = pool_of(vec![w1.clone(), w2.clone()]).await;

        let first = pool
            .submit_render_job("job-a", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert!(first.success);
        let second = pool
            .submit_render_job("job-b", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert!(second.success);

        // One job each, not both on the first worker
        assert_eq!(w1.jobs.lock().as_slice(), ["job-a"]);
        assert_eq!(w2.jobs.lock().as_slice(), ["job-b"]);

        let status = pool.get_status();
        assert_eq!(status["busy_workers"], json!(2));
    }

    #[tokio::test]
    async fn test_webhook_release_frees_the_worker() {
        let w1 = FlakyWorker::new(true);
        let pool = pool_of(vec![w1.clone()]).await;

        pool.submit_render_job("job-a", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert_eq!(pool.get_status()["busy_workers"], json!(1));

        pool.mark_job_complete("job-a");
        assert_eq!(pool.get_status()["busy_workers"], json!(0));

        // A new job lands on the freed worker (queue absorbs when busy too)
        pool.submit_render_job("job-b", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert_eq!(w1.jobs.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_submission_failure_retries_on_idle_backup() {
        let broken = FlakyWorker::new(false);
        let backup = FlakyWorker::new(true);
        let pool = pool_of(vec![broken.clone(), backup.clone()]).await;

        let outcome = pool
            .submit_render_job("job-a", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(backup.jobs.lock().as_slice(), ["job-a"]);

        // The broken worker was released on failure
        let status = pool.get_status();
        assert_eq!(status["busy_workers"], json!(1));
    }

    #[tokio::test]
    async fn test_all_workers_broken_reports_failure() {
        let pool = pool_of(vec![FlakyWorker::new(false), FlakyWorker::new(false)]).await;
        let outcome = pool
            .submit_render_job("job-a", &json!({}), "u", "p", None)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("connection refused"));
    }
}
