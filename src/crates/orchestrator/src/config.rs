//! Orchestrator configuration
//!
//! Serde structs with environment-derived constructors. Every knob has a
//! code default matching the production topology; `from_env` overrides from
//! the process environment.

use crate::render::dispatcher::RenderMode;
use serde::{Deserialize, Serialize};
use std::env;

/// One render worker endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl WorkerEndpoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Render dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Which dispatch path the render step takes
    pub mode: RenderMode,

    /// Single-backend editor URL
    pub editor_url: String,

    /// Shared-services URL (concat, chunk cleanup)
    pub v_services_url: String,

    /// Base URL workers call back into
    pub webhook_base_url: String,

    /// Webhook path appended to the base URL
    pub callback_endpoint: String,

    /// Signing/upload service URL (blob store boundary)
    pub signing_service_url: String,

    /// Structured upload paths (`users/{u}/projects/{p}/renders/...`)
    /// versus the legacy flat `{job}_final.mp4`
    pub use_structured_paths: bool,

    /// Chunk-to-worker rotation offset, for per-worker diagnosis
    pub worker_rotation: usize,

    /// Maximum chunks dispatched concurrently in pool mode
    pub max_concurrent_chunks: usize,

    /// Frame-chunking worker pool
    pub pool_workers: Vec<WorkerEndpoint>,

    /// Whole-job single workers
    pub single_workers: Vec<WorkerEndpoint>,

    /// Cloud-function backend URL
    pub cloud_url: String,

    /// Cloud-function memory size (drives the mode hint)
    pub cloud_memory_mb: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        // Port 5020 is taken by the studio container, hence the gap.
        let pool_workers = [
            ("1", "v-editor-1", 5018),
            ("2", "v-editor-2", 5019),
            ("3", "v-editor-3", 5022),
            ("4", "v-editor-4", 5021),
            ("5", "v-editor-5", 5023),
            ("6", "v-editor-6", 5024),
        ]
        .iter()
        .map(|(id, name, _port)| {
            // Inside the cluster every worker listens on the same port
            WorkerEndpoint::new(*id, *name, format!("http://{name}:5018"))
        })
        .collect();

        let single_workers = [
            ("single-1", "v-editor-single-1", 5010),
            ("single-2", "v-editor-single-2", 5011),
            ("single-3", "v-editor-single-3", 5012),
        ]
        .iter()
        .map(|(id, name, port)| {
            WorkerEndpoint::new(*id, *name, format!("http://{name}:{port}"))
        })
        .collect();

        Self {
            mode: RenderMode::Single,
            editor_url: "http://v-editor:5018".to_string(),
            v_services_url: "http://v-services:5000".to_string(),
            webhook_base_url: "https://api.vinicius.ai".to_string(),
            callback_endpoint: "/api/webhook/render-complete".to_string(),
            signing_service_url: "http://supabase-custom-api:5000".to_string(),
            use_structured_paths: true,
            worker_rotation: 0,
            max_concurrent_chunks: 6,
            pool_workers,
            single_workers,
            cloud_url: "http://v-editor-lambda:5050".to_string(),
            cloud_memory_mb: 2048,
        }
    }
}

impl RenderConfig {
    /// Build from the process environment, falling back to defaults.
    ///
    /// `V_EDITOR_BASE_URL` (remote tunnel) rewrites every pool worker to
    /// `{base}:{port}` with the per-worker external ports.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(mode) = env::var("RENDER_MODE") {
            if let Some(parsed) = RenderMode::parse(&mode) {
                config.mode = parsed;
            }
        }
        if let Ok(url) = env::var("V_EDITOR_URL") {
            config.editor_url = url;
        }
        if let Ok(url) = env::var("V_SERVICES_URL") {
            config.v_services_url = url;
        }
        if let Ok(url) = env::var("WEBHOOK_INTERNAL_URL").or_else(|_| env::var("CALLBACK_BASE_URL"))
        {
            config.webhook_base_url = url;
        }
        if let Ok(url) = env::var("SIGNING_SERVICE_URL") {
            config.signing_service_url = url;
        }
        if let Ok(flag) = env::var("USE_STRUCTURED_RENDER_PATHS") {
            config.use_structured_paths = flag.eq_ignore_ascii_case("true");
        }
        if let Ok(rotation) = env::var("WORKER_ROTATION") {
            config.worker_rotation = rotation.parse().unwrap_or(0);
        }
        if let Ok(url) = env::var("V_EDITOR_LAMBDA_URL") {
            config.cloud_url = url;
        }

        if let Ok(base) = env::var("V_EDITOR_BASE_URL") {
            let external_ports = [5018u16, 5019, 5022, 5021, 5023, 5024];
            for (worker, port) in config.pool_workers.iter_mut().zip(external_ports) {
                worker.url = format!("{base}:{port}");
            }
        }

        config
    }

    pub fn with_mode(mut self, mode: RenderMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_pool_workers(mut self, workers: Vec<WorkerEndpoint>) -> Self {
        self.pool_workers = workers;
        self
    }

    /// Full webhook URL for render callbacks
    pub fn webhook_url(&self) -> String {
        format!("{}{}", self.webhook_base_url, self.callback_endpoint)
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub database_url: String,
    pub render: RenderConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:orchestrator.db".to_string(),
            render: RenderConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var("DATABASE_URL") {
            config.database_url = url;
        }
        config.render = RenderConfig::from_env();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RenderConfig::default();
        assert_eq!(config.pool_workers.len(), 6);
        assert_eq!(config.single_workers.len(), 3);
        assert_eq!(config.max_concurrent_chunks, 6);
        assert_eq!(
            config.webhook_url(),
            "https://api.vinicius.ai/api/webhook/render-complete"
        );
        // All pool workers share the in-cluster port
        assert!(config.pool_workers.iter().all(|w| w.url.ends_with(":5018")));
    }
}
