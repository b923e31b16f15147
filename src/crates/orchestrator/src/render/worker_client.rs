//! HTTP clients for render workers and the concat service
//!
//! The worker contract: `GET /health`, `POST /render-video`,
//! `GET /job/{job_id}`. Poll replies distinguish 404 (not-found) from 5xx
//! (server error) because the pool's poll loop treats them differently
//! (pre-ack 404s are normal startup; post-ack 404s are fatal).

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Status document returned by a worker's job endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkerJobStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub shared_path: Option<String>,
    #[serde(default)]
    pub b2_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerJobStatus {
    /// Chunk output location: the shared-volume path wins over the local one
    pub fn chunk_path(&self) -> Option<String> {
        self.shared_path.clone().or_else(|| self.output_path.clone())
    }
}

/// One poll of a worker's job endpoint
#[derive(Debug, Clone)]
pub enum PollReply {
    /// 200 with a status document
    Status(WorkerJobStatus),
    /// 404: the worker does not know the job (yet, or anymore)
    NotFound,
    /// 5xx or another unexpected status
    ServerError(u16),
}

/// Render worker HTTP interface
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// True when the worker answers its health endpoint with 200
    async fn health(&self) -> bool;

    /// Submit a render payload; returns the worker's response body
    async fn submit(&self, payload: &Value, timeout: Duration) -> Result<Value>;

    /// Poll the worker for a job's status
    async fn job_status(&self, job_id: &str) -> Result<PollReply>;
}

/// Reqwest-backed worker client
pub struct HttpWorkerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn health(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        matches!(response, Ok(r) if r.status().is_success())
    }

    async fn submit(&self, payload: &Value, timeout: Duration) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/render-video", self.base_url))
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 && status.as_u16() != 202 {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(crate::OrchestratorError::Render(format!(
                "Worker returned {status}: {snippet}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn job_status(&self, job_id: &str) -> Result<PollReply> {
        let response = self
            .client
            .get(format!("{}/job/{job_id}", self.base_url))
            .timeout(Duration::from_secs(15))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(PollReply::NotFound);
        }
        if status.is_success() {
            return Ok(PollReply::Status(response.json().await?));
        }
        Ok(PollReply::ServerError(status.as_u16()))
    }
}

/// Concat-service result
#[derive(Debug, Clone, Deserialize)]
pub struct ConcatResult {
    pub output_path: Option<String>,
    pub output_url: Option<String>,
}

/// FFmpeg concat service interface
#[async_trait]
pub trait ConcatApi: Send + Sync {
    /// Concatenate chunk files in order into one output file
    async fn concat_chunks(
        &self,
        chunk_paths: &[String],
        output_filename: &str,
        job_id: &str,
    ) -> Result<ConcatResult>;

    /// Delete chunk files left behind by earlier renders of this job
    async fn cleanup_chunks(&self, job_id: &str) -> Result<u64>;
}

/// Reqwest-backed concat client against the shared-services host
pub struct HttpConcatClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpConcatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ConcatApi for HttpConcatClient {
    async fn concat_chunks(
        &self,
        chunk_paths: &[String],
        output_filename: &str,
        job_id: &str,
    ) -> Result<ConcatResult> {
        let response = self
            .client
            .post(format!("{}/ffmpeg/concat-chunks", self.base_url))
            .timeout(Duration::from_secs(120))
            .json(&serde_json::json!({
                "chunk_paths": chunk_paths,
                "output_filename": output_filename,
                "job_id": job_id,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(crate::OrchestratorError::Render(format!(
                "Concat failed: {status} - {snippet}"
            )));
        }
        Ok(response.json().await?)
    }

    async fn cleanup_chunks(&self, job_id: &str) -> Result<u64> {
        let response = self
            .client
            .post(format!("{}/ffmpeg/cleanup-chunks", self.base_url))
            .timeout(Duration::from_secs(10))
            .json(&serde_json::json!({"job_id": job_id}))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        Ok(body
            .get("deleted_count")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_path_prefers_shared_volume() {
        let status = WorkerJobStatus {
            status: "completed".into(),
            output_path: Some("/local/out.mp4".into()),
            shared_path: Some("/app/shared/out.mp4".into()),
            ..Default::default()
        };
        assert_eq!(status.chunk_path().as_deref(), Some("/app/shared/out.mp4"));

        let local_only = WorkerJobStatus {
            output_path: Some("/local/out.mp4".into()),
            ..Default::default()
        };
        assert_eq!(local_only.chunk_path().as_deref(), Some("/local/out.mp4"));
    }

    #[test]
    fn test_job_status_deserializes_partial_documents() {
        let status: WorkerJobStatus =
            serde_json::from_str(r#"{"status": "rendering", "progress": 42.5}"#).unwrap();
        assert_eq!(status.status, "rendering");
        assert_eq!(status.progress, Some(42.5));
        assert!(status.chunk_path().is_none());
    }
}
