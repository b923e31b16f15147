//! Payload URL rewriting
//!
//! Pool workers run inside the cluster and cannot reach the public edge,
//! so every external hostname in a payload is mapped to its in-cluster
//! DNS name before dispatch. The mapping is a closed set; the rewrite is
//! recursive over the whole JSON tree and is a fixed point (rewriting
//! twice equals rewriting once).
//!
//! The reverse concern exists for cloud backends: locally-served asset
//! paths must become public URLs before the payload leaves the cluster.

use serde_json::Value;
use tracing::debug;

/// External host to in-cluster DNS, including http/https variants.
pub const EXTERNAL_TO_INTERNAL_URL_MAP: &[(&str, &str)] = &[
    ("https://services-home.vinicius.ai", "http://v-services:5000"),
    ("http://services-home.vinicius.ai", "http://v-services:5000"),
    ("https://services.vinicius.ai", "http://v-services:5000"),
    ("http://services.vinicius.ai", "http://v-services:5000"),
    ("https://api.vinicius.ai", "http://supabase-custom-api:5000"),
    ("http://api.vinicius.ai", "http://supabase-custom-api:5000"),
];

/// Locally-served asset prefixes to their public shared-files route.
const LOCAL_TO_PUBLIC_URL_MAP: &[(&str, &str)] = &[
    (
        "http://localhost:3000/app/shared/",
        "https://services.vinicius.ai/shared-files/",
    ),
    (
        "http://localhost:3000/shared-assets/",
        "https://services.vinicius.ai/shared-files/",
    ),
    (
        "http://localhost:3000/shared/",
        "https://services.vinicius.ai/shared-files/",
    ),
    ("/app/shared/", "https://services.vinicius.ai/shared-files/"),
    ("/shared-assets/", "https://services.vinicius.ai/shared-files/"),
];

/// Rewrite one URL from external to in-cluster form
pub fn to_internal_url(url: &str) -> String {
    for (external, internal) in EXTERNAL_TO_INTERNAL_URL_MAP {
        if url.contains(external) {
            let converted = url.replace(external, internal);
            debug!(from = %url, to = %converted, "URL rewritten to internal");
            return converted;
        }
    }
    url.to_string()
}

/// Rewrite every string in the payload tree from external to internal form
pub fn rewrite_payload_to_internal(value: &mut Value) {
    rewrite_strings(value, &to_internal_url);
}

/// Rewrite one locally-served asset URL to its public form
pub fn to_public_url(url: &str) -> String {
    let mut result = url.to_string();
    for (local, public) in LOCAL_TO_PUBLIC_URL_MAP {
        if result.starts_with(local) || result.contains(local) {
            result = result.replace(local, public);
        }
    }
    result
}

/// Rewrite every locally-served asset URL in the payload to public form
/// (cloud backends cannot resolve cluster-internal names)
pub fn rewrite_payload_to_public(value: &mut Value) {
    rewrite_strings(value, &to_public_url);
}

fn rewrite_strings(value: &mut Value, rewrite: &dyn Fn(&str) -> String) {
    match value {
        Value::String(s) => {
            let rewritten = rewrite(s);
            if rewritten != *s {
                *s = rewritten;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_strings(item, rewrite);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                rewrite_strings(item, rewrite);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_known_hosts_are_mapped() {
        assert_eq!(
            to_internal_url("https://services.vinicius.ai/shared/x.png"),
            "http://v-services:5000/shared/x.png"
        );
        assert_eq!(
            to_internal_url("http://api.vinicius.ai/api/foo"),
            "http://supabase-custom-api:5000/api/foo"
        );
        assert_eq!(
            to_internal_url("https://services-home.vinicius.ai/a"),
            "http://v-services:5000/a"
        );
        // Unknown hosts pass through untouched
        assert_eq!(
            to_internal_url("https://cdn.example.com/v.mp4"),
            "https://cdn.example.com/v.mp4"
        );
    }

    #[test]
    fn test_recursive_rewrite_covers_nested_fields() {
        let mut payload = json!({
            "video_url": "https://services.vinicius.ai/v.mp4",
            "tracks": {
                "subtitles": [
                    {"src": "https://services.vinicius.ai/s1.png", "x": 10},
                    {"src": "http://other.host/s2.png"}
                ],
                "bg_full_screen": [{"nested": {"deep": "https://api.vinicius.ai/b.mp4"}}]
            },
            "fps": 30
        });
        rewrite_payload_to_internal(&mut payload);

        assert_eq!(payload["video_url"], json!("http://v-services:5000/v.mp4"));
        assert_eq!(
            payload["tracks"]["subtitles"][0]["src"],
            json!("http://v-services:5000/s1.png")
        );
        assert_eq!(
            payload["tracks"]["subtitles"][1]["src"],
            json!("http://other.host/s2.png")
        );
        assert_eq!(
            payload["tracks"]["bg_full_screen"][0]["nested"]["deep"],
            json!("http://supabase-custom-api:5000/b.mp4")
        );
        assert_eq!(payload["fps"], json!(30));
    }

    #[test]
    fn test_rewrite_is_a_fixed_point() {
        let mut once = json!({
            "a": "https://services.vinicius.ai/x",
            "b": ["http://api.vinicius.ai/y", {"c": "https://services-home.vinicius.ai/z"}]
        });
        rewrite_payload_to_internal(&mut once);
        let mut twice = once.clone();
        rewrite_payload_to_internal(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_public_rewrite_for_cloud_backends() {
        assert_eq!(
            to_public_url("http://localhost:3000/app/shared/pngs/a.png"),
            "https://services.vinicius.ai/shared-files/pngs/a.png"
        );
        assert_eq!(
            to_public_url("/app/shared/pngs/a.png"),
            "https://services.vinicius.ai/shared-files/pngs/a.png"
        );

        let mut payload = json!({"layers": [{"src": "/shared-assets/b.png"}]});
        rewrite_payload_to_public(&mut payload);
        assert_eq!(
            payload["layers"][0]["src"],
            json!("https://services.vinicius.ai/shared-files/b.png")
        );
    }
}
