//! Cloud-function render dispatch
//!
//! Stateless serverless backend: the whole payload ships with the request
//! and the final artifact arrives through the webhook (async-ack). Three
//! performance modes map from the configured memory size. Before dispatch
//! the base video's signed URL is renewed (serverless cold starts can
//! outlive a stale signature) and locally-served asset paths are rewritten
//! to public URLs the function can actually reach.

use crate::config::RenderConfig;
use crate::render::dispatcher::RenderOutcome;
use crate::render::signing::{extract_blob_path, BlobStore, HANDOFF_VALIDITY_SECS};
use crate::render::url_rewrite::rewrite_payload_to_public;
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Performance mode from the configured function memory size
pub fn mode_for_memory(memory_mb: u32) -> &'static str {
    if memory_mb <= 1024 {
        "cloud_slow"
    } else if memory_mb >= 3008 {
        "cloud_fast"
    } else {
        "cloud_medium"
    }
}

/// Dispatch to the cloud-function render backend
pub struct CloudRenderService {
    api_url: String,
    webhook_url: String,
    memory_mb: u32,
    blob_store: Arc<dyn BlobStore>,
    client: reqwest::Client,
}

impl CloudRenderService {
    pub fn new(
        api_url: impl Into<String>,
        webhook_url: impl Into<String>,
        memory_mb: u32,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            webhook_url: webhook_url.into(),
            memory_mb,
            blob_store,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &RenderConfig, blob_store: Arc<dyn BlobStore>) -> Self {
        Self::new(
            config.cloud_url.clone(),
            config.webhook_url(),
            config.cloud_memory_mb,
            blob_store,
        )
    }

    /// True when the backend is reachable and has a function configured
    pub async fn is_configured(&self) -> bool {
        let response = self
            .client
            .get(format!("{}/health", self.api_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => r
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| {
                    body.get("configured")
                        .and_then(|c| c.get("function"))
                        .and_then(Value::as_bool)
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Renew the base video's signed URL so it cannot expire mid-render
    async fn refresh_video_url(&self, payload: &mut Value) {
        let Some(video_url) = payload.get("video_url").and_then(Value::as_str) else {
            return;
        };
        let Some(path) = extract_blob_path(video_url) else {
            return;
        };
        match self
            .blob_store
            .generate_signed_url(&path, HANDOFF_VALIDITY_SECS)
            .await
        {
            Ok(signed) => {
                info!("Base video signed URL renewed for cloud dispatch");
                payload["video_url"] = json!(signed);
            }
            Err(e) => {
                warn!(error = %e, "Could not renew base video URL, keeping original");
            }
        }
    }

    /// Submit one render to the cloud function (async-ack).
    pub async fn submit_render_job(
        &self,
        job_id: &str,
        payload: &Value,
        user_id: &str,
        project_id: &str,
        template_id: Option<&str>,
    ) -> Result<RenderOutcome> {
        let mode = mode_for_memory(self.memory_mb);
        info!(job_id = %job_id, mode, api = %self.api_url, "Submitting cloud render");

        let mut input_props = payload.clone();
        self.refresh_video_url(&mut input_props).await;
        rewrite_payload_to_public(&mut input_props);

        let api_payload = json!({
            "jobId": job_id,
            "composition": "VideoComposition",
            "inputProps": input_props,
            "webhookUrl": self.webhook_url,
            "mode": mode,
            "userId": user_id,
            "projectId": project_id,
            "templateId": template_id,
        });

        let response = self
            .client
            .post(format!("{}/render", self.api_url))
            .timeout(Duration::from_secs(30))
            .json(&api_payload)
            .send()
            .await;

        match response {
            Ok(r) if matches!(r.status().as_u16(), 200 | 202) => {
                let body: Value = r.json().await.unwrap_or(json!({}));
                let render_id = body
                    .get("renderId")
                    .and_then(Value::as_str)
                    .unwrap_or(job_id);
                info!(job_id = %job_id, render_id = %render_id, "Cloud render started");
                Ok(RenderOutcome::processing(
                    job_id,
                    format!("Cloud render {render_id} started ({mode})"),
                ))
            }
            Ok(r) => {
                let status = r.status();
                let body = r.text().await.unwrap_or_default();
                let snippet: String = body.chars().take(500).collect();
                error!(job_id = %job_id, %status, "Cloud backend rejected render");
                Ok(RenderOutcome::failed(
                    job_id,
                    format!("Cloud backend returned {status}: {snippet}"),
                ))
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Cloud backend unreachable");
                Ok(RenderOutcome::failed(
                    job_id,
                    format!("Cloud backend not reachable at {}: {e}", self.api_url),
                ))
            }
        }
    }

    /// Status of an in-flight cloud render
    pub async fn render_status(&self, render_id: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/status/{render_id}", self.api_url))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            404 => Ok(json!({"status": "not_found"})),
            code => Ok(json!({"status": "error", "error": format!("API returned {code}")})),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_for_memory() {
        assert_eq!(mode_for_memory(512), "cloud_slow");
        assert_eq!(mode_for_memory(1024), "cloud_slow");
        assert_eq!(mode_for_memory(2048), "cloud_medium");
        assert_eq!(mode_for_memory(3008), "cloud_fast");
        assert_eq!(mode_for_memory(4096), "cloud_fast");
    }
}
