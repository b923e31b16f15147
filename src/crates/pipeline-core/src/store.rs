//! Persistence and notification seams
//!
//! [`StateStore`] abstracts the job row holding the pipeline state; the
//! orchestrator crate backs it with SQL, and [`InMemoryStateStore`] is the
//! reference implementation for tests and demos. A single orchestrator owns
//! each job, so writes per job are serialized by construction.

use crate::state::PipelineState;
use crate::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    AwaitingReview,
    Completed,
    Failed,
}

impl JobStatus {
    /// Stable string form used in the status column
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::AwaitingReview => "awaiting_review",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage seam for the pipeline state of a job.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the current state, or `None` when the job does not exist.
    async fn load(&self, job_id: &str) -> Result<Option<PipelineState>>;

    /// Persist the state after `step_name` executed.
    async fn save(&self, job_id: &str, state: &PipelineState, step_name: &str) -> Result<()>;

    /// Update the job status without touching the state.
    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()>;
}

/// In-memory state store for tests and demos.
///
/// Clones share the same map. Statuses are tracked next to the states so
/// tests can assert on transitions.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, PipelineState>>>,
    statuses: Arc<RwLock<HashMap<String, (JobStatus, Option<String>)>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a job before a run
    pub async fn insert(&self, state: PipelineState) {
        let job_id = state.job_id.clone();
        self.states.write().await.insert(job_id.clone(), state);
        self.statuses
            .write()
            .await
            .insert(job_id, (JobStatus::Pending, None));
    }

    /// Current status of a job, if known
    pub async fn status(&self, job_id: &str) -> Option<(JobStatus, Option<String>)> {
        self.statuses.read().await.get(job_id).cloned()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, job_id: &str) -> Result<Option<PipelineState>> {
        Ok(self.states.read().await.get(job_id).cloned())
    }

    async fn save(&self, job_id: &str, state: &PipelineState, step_name: &str) -> Result<()> {
        self.states
            .write()
            .await
            .insert(job_id.to_string(), state.clone());
        info!(
            job_id = %job_id,
            step = %step_name,
            completed = state.completed_steps.len(),
            "State saved"
        );
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut statuses = self.statuses.write().await;
        if !statuses.contains_key(job_id) && !self.states.read().await.contains_key(job_id) {
            return Err(EngineError::JobNotFound(job_id.to_string()));
        }
        statuses.insert(job_id.to_string(), (status, error.map(String::from)));
        Ok(())
    }
}

/// Out-of-band notification on terminal pipeline failure.
///
/// Strictly best-effort: implementations must not let their own failures
/// escalate, and the engine ignores whatever they do.
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify_failure(
        &self,
        job_id: &str,
        step_name: &str,
        error: &str,
        project_id: Option<&str>,
        user_id: Option<&str>,
    );
}

/// Notifier that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl FailureNotifier for NoopNotifier {
    async fn notify_failure(
        &self,
        job_id: &str,
        step_name: &str,
        error: &str,
        _project_id: Option<&str>,
        _user_id: Option<&str>,
    ) {
        info!(job_id = %job_id, step = %step_name, error = %error, "Pipeline failure (no notifier configured)");
    }
}
