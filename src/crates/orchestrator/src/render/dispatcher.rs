//! Render dispatch façade
//!
//! One entry point for the render step; the configured [`RenderMode`]
//! selects which dispatch path a job takes.

use crate::config::RenderConfig;
use crate::db::connection::DatabasePool;
use crate::render::cloud::CloudRenderService;
use crate::render::service::{RenderService, WorkerFlavor};
use crate::render::signing::BlobStore;
use crate::render::single_pool::SinglePoolService;
use crate::render::worker_pool::WorkerPoolService;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Which dispatch path the render step takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// One external worker (synchronous or ack-then-webhook)
    Single,
    /// Frame-range chunking across the worker pool
    WorkerPool,
    /// Whole jobs round-robined over sibling workers
    SinglePool,
    /// Stateless cloud-function backend
    Cloud,
}

impl RenderMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "worker_pool" | "pool" => Some(Self::WorkerPool),
            "single_pool" => Some(Self::SinglePool),
            "cloud" | "lambda" => Some(Self::Cloud),
            _ => None,
        }
    }
}

/// Result of a render dispatch, whatever the path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderOutcome {
    pub success: bool,
    /// `completed` | `processing` | `error`
    pub render_status: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers_used: Option<usize>,
}

impl RenderOutcome {
    /// Terminal success with the final artifact URL
    pub fn completed(job_id: impl Into<String>, output_url: impl Into<String>) -> Self {
        Self {
            success: true,
            render_status: "completed".to_string(),
            job_id: job_id.into(),
            output_url: Some(output_url.into()),
            output_path: None,
            error: None,
            message: None,
            workers_used: None,
        }
    }

    /// Accepted; the final artifact arrives through the webhook
    pub fn processing(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            render_status: "processing".to_string(),
            job_id: job_id.into(),
            output_url: None,
            output_path: None,
            error: None,
            message: Some(message.into()),
            workers_used: None,
        }
    }

    /// Dispatch failed
    pub fn failed(job_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            render_status: "error".to_string(),
            job_id: job_id.into(),
            output_url: None,
            output_path: None,
            error: Some(error.into()),
            message: None,
            workers_used: None,
        }
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        self.output_path = Some(path.into());
        self
    }

    pub fn with_workers_used(mut self, count: usize) -> Self {
        self.workers_used = Some(count);
        self
    }
}

/// Configuration-selected façade over the four dispatch services
pub struct RenderDispatcher {
    mode: RenderMode,
    single: RenderService,
    pool: WorkerPoolService,
    single_pool: SinglePoolService,
    cloud: CloudRenderService,
}

impl RenderDispatcher {
    /// Wire up every dispatch path from the render configuration
    pub fn from_config(
        config: &RenderConfig,
        db: DatabasePool,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            mode: config.mode,
            single: RenderService::from_config(config, db.clone(), blob_store.clone()),
            pool: WorkerPoolService::from_config(config, blob_store.clone()),
            single_pool: SinglePoolService::from_config(config, db, blob_store.clone()),
            cloud: CloudRenderService::from_config(config, blob_store),
        }
    }

    pub fn mode(&self) -> RenderMode {
        self.mode
    }

    /// Dispatch a render through the configured path
    pub async fn dispatch(
        &self,
        job_id: &str,
        payload: &Value,
        user_id: &str,
        project_id: &str,
        template_id: Option<&str>,
    ) -> Result<RenderOutcome> {
        match self.mode {
            RenderMode::Single => {
                self.single
                    .submit_render_job(job_id, payload, user_id, project_id, template_id)
                    .await
            }
            RenderMode::WorkerPool => {
                self.pool
                    .render_distributed(job_id, payload, user_id, project_id)
                    .await
            }
            RenderMode::SinglePool => {
                self.single_pool
                    .submit_render_job(job_id, payload, user_id, project_id, template_id)
                    .await
            }
            RenderMode::Cloud => {
                self.cloud
                    .submit_render_job(job_id, payload, user_id, project_id, template_id)
                    .await
            }
        }
    }

    /// Release a single-pool worker when the completion webhook arrives
    pub fn mark_job_complete(&self, job_id: &str) {
        self.single_pool.mark_job_complete(job_id);
    }
}
