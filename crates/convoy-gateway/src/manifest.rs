//! Fallback source for app manifests.
//!
//! The manifest normally ships in convoy.toml. When it is absent (fresh
//! deployment, stripped config), the internal API can supply it: without a
//! manifest the model has NO tools at all and will hallucinate tool
//! results instead of calling them.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{info, warn};

use convoy_core::config::AppManifest;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetch `GET $INTERNAL_API_BASE_URL/apps/metadata`, authenticated with
/// `INTERNAL_API_SHARED_TOKEN` when set. Returns `None` (with a warning)
/// on any failure; the caller proceeds with whatever the config had.
pub async fn fetch_apps_manifest() -> Option<BTreeMap<String, AppManifest>> {
    let base_url = std::env::var("INTERNAL_API_BASE_URL").ok()?;
    let url = format!("{base_url}/apps/metadata");

    let client = match reqwest::Client::builder().timeout(FETCH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "could not build client for manifest fetch");
            return None;
        }
    };

    let mut request = client.get(&url);
    if let Ok(token) = std::env::var("INTERNAL_API_SHARED_TOKEN") {
        request = request.header("X-Internal-Service-Token", token);
    }

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%url, error = %e, "app manifest fetch failed");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(%url, status = %response.status(), "app manifest fetch rejected");
        return None;
    }

    let body: serde_json::Value = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "app manifest response undecodable");
            return None;
        }
    };
    let apps = body.get("apps").cloned().unwrap_or_default();
    match serde_json::from_value::<BTreeMap<String, AppManifest>>(apps) {
        Ok(manifests) if !manifests.is_empty() => {
            info!(count = manifests.len(), "fetched app manifests from internal API");
            Some(manifests)
        }
        Ok(_) => {
            warn!("internal API returned an empty app manifest");
            None
        }
        Err(e) => {
            warn!(error = %e, "app manifest entries undecodable");
            None
        }
    }
}
