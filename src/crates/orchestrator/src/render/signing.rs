//! Signed-URL management at the blob-store boundary
//!
//! Private CDN objects are reachable only through time-limited signed URLs.
//! Render payloads can sit in queues long enough for embedded signatures to
//! expire, so every CDN URL is re-signed for 24 hours immediately before a
//! payload is handed to a worker. Signing failures are logged and the
//! original URL is kept; the render may still succeed if the old signature
//! has not expired.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Host fragment identifying private CDN objects
pub const CDN_HOST: &str = "vinicius-ai-cdn-global";

/// Signed-URL validity for cross-service handoff (worker downloads)
pub const HANDOFF_VALIDITY_SECS: u64 = 86_400;

/// Signed-URL validity for end-user delivery
pub const DELIVERY_VALIDITY_SECS: u64 = 3_600;

/// Blob-store boundary: signing and upload. The store itself is a black
/// box; implementations talk to whatever service fronts it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Generate a signed download URL for a stored object path
    async fn generate_signed_url(&self, file_path: &str, valid_secs: u64) -> Result<String>;

    /// Copy an object from a URL into the store; returns a signed URL of
    /// the destination
    async fn upload_from_url(
        &self,
        source_url: &str,
        destination_path: &str,
        content_type: &str,
    ) -> Result<String>;
}

/// Blob store backed by the signing/upload HTTP service
pub struct HttpBlobStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn generate_signed_url(&self, file_path: &str, valid_secs: u64) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/storage/signed-url", self.base_url))
            .json(&serde_json::json!({
                "file_path": file_path,
                "valid_duration_seconds": valid_secs,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        body.get("signed_url")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                crate::OrchestratorError::Render("Signing service returned no signed_url".into())
            })
    }

    async fn upload_from_url(
        &self,
        source_url: &str,
        destination_path: &str,
        content_type: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/storage/upload-from-url", self.base_url))
            .json(&serde_json::json!({
                "source_url": source_url,
                "destination_path": destination_path,
                "content_type": content_type,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        body.get("public_url")
            .or_else(|| body.get("signed_url"))
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                crate::OrchestratorError::Render("Upload service returned no URL".into())
            })
    }
}

/// True when the URL points at a private CDN object
pub fn is_cdn_url(url: &str) -> bool {
    url.contains(CDN_HOST)
}

/// Extract the object path from a CDN download URL.
///
/// URLs look like `https://host/file/<bucket>/<path>?Authorization=...`;
/// the query string (an old signature) is dropped.
pub fn extract_blob_path(url: &str) -> Option<String> {
    let base = url.split('?').next()?;
    let marker = format!("/file/{CDN_HOST}/");
    let start = base.find(&marker)? + marker.len();
    let path = &base[start..];
    (!path.is_empty()).then(|| path.to_string())
}

/// Re-sign every CDN URL in the payload tree for cross-service handoff.
///
/// Walks the whole tree; any string field matching the CDN host is
/// replaced by a freshly signed 24-hour URL. On signing failure the
/// original URL is kept and a warning is logged.
pub async fn refresh_signed_urls(blob_store: &Arc<dyn BlobStore>, payload: &mut Value) {
    let mut refreshed = 0usize;
    let mut failed = 0usize;
    refresh_value(blob_store, payload, &mut refreshed, &mut failed).await;
    if refreshed > 0 || failed > 0 {
        info!(refreshed, failed, "Signed-URL refresh pass complete");
    }
}

fn refresh_value<'a>(
    blob_store: &'a Arc<dyn BlobStore>,
    value: &'a mut Value,
    refreshed: &'a mut usize,
    failed: &'a mut usize,
) -> futures::future::BoxFuture<'a, ()> {
    Box::pin(async move {
        match value {
            Value::String(s) if is_cdn_url(s) => {
                let Some(path) = extract_blob_path(s) else {
                    return;
                };
                match blob_store
                    .generate_signed_url(&path, HANDOFF_VALIDITY_SECS)
                    .await
                {
                    Ok(signed) => {
                        *s = signed;
                        *refreshed += 1;
                    }
                    Err(e) => {
                        warn!(path = %path, error = %e, "Could not refresh signed URL, keeping original");
                        *failed += 1;
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    refresh_value(blob_store, item, refreshed, failed).await;
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    refresh_value(blob_store, item, refreshed, failed).await;
                }
            }
            _ => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeStore;

    #[async_trait]
    impl BlobStore for FakeStore {
        async fn generate_signed_url(&self, file_path: &str, valid_secs: u64) -> Result<String> {
            if file_path.contains("broken") {
                return Err(crate::OrchestratorError::Render("signing down".into()));
            }
            Ok(format!("https://cdn.example/{file_path}?sig=fresh&ttl={valid_secs}"))
        }

        async fn upload_from_url(&self, _: &str, destination: &str, _: &str) -> Result<String> {
            Ok(format!("https://cdn.example/{destination}?sig=up"))
        }
    }

    #[test]
    fn test_extract_blob_path() {
        let url = format!(
            "https://f001.backblazeb2.com/file/{CDN_HOST}/users/u1/projects/p1/v.mp4?Authorization=old"
        );
        assert_eq!(
            extract_blob_path(&url).as_deref(),
            Some("users/u1/projects/p1/v.mp4")
        );
        assert!(extract_blob_path("https://example.com/other.mp4").is_none());
    }

    #[tokio::test]
    async fn test_refresh_walks_tracks_and_overlays() {
        let store: Arc<dyn BlobStore> = Arc::new(FakeStore);
        let cdn = |p: &str| format!("https://host/file/{CDN_HOST}/{p}?Authorization=stale");

        let mut payload = json!({
            "video_url": cdn("base/v.mp4"),
            "tracks": {
                "bg_full_screen": [{"src": cdn("bg/b.mp4"), "is_video": true}],
                "person_overlay": [{
                    "src": cdn("overlay/o.webm"),
                    "mask_url": cdn("overlay/mask.mp4"),
                    "original_video_url": cdn("overlay/orig.mp4"),
                }],
                "video_segments": [{"src": cdn("seg/s1.mp4")}],
            },
            "other": "https://unrelated.example/x.png",
        });

        refresh_signed_urls(&store, &mut payload).await;

        for value in [
            &payload["video_url"],
            &payload["tracks"]["bg_full_screen"][0]["src"],
            &payload["tracks"]["person_overlay"][0]["src"],
            &payload["tracks"]["person_overlay"][0]["mask_url"],
            &payload["tracks"]["person_overlay"][0]["original_video_url"],
            &payload["tracks"]["video_segments"][0]["src"],
        ] {
            let url = value.as_str().unwrap();
            assert!(url.contains("sig=fresh"), "not refreshed: {url}");
            assert!(!url.contains("Authorization=stale"));
        }
        assert_eq!(payload["other"], json!("https://unrelated.example/x.png"));
    }

    #[tokio::test]
    async fn test_signing_failure_keeps_original_url() {
        let store: Arc<dyn BlobStore> = Arc::new(FakeStore);
        let original = format!("https://host/file/{CDN_HOST}/broken/v.mp4?Authorization=stale");
        let mut payload = json!({"video_url": original.clone()});

        refresh_signed_urls(&store, &mut payload).await;
        assert_eq!(payload["video_url"], json!(original));
    }
}
