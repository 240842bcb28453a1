use std::time::Duration;

use crate::config::JwksCache;
use crate::error::CoreError;
use crate::models::JwksSource;

/// Fetches and caches a provider's JWKS documents. A TTL cache shared via
/// `AppState` absorbs repeated fetches of the same source across requests;
/// a stale entry is served as-is on fetch failure rather than failing the
/// request outright, so a transient outage at the JWKS origin doesn't take
/// down client-assertion verification entirely.
pub struct JwksFetcher<'a> {
    client: &'a reqwest::Client,
    cache: &'a JwksCache,
    ttl: Duration,
}

impl<'a> JwksFetcher<'a> {
    pub fn new(client: &'a reqwest::Client, cache: &'a JwksCache, ttl_secs: u64) -> Self {
        Self {
            client,
            cache,
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Returns the `keys` array of the source's JWKS document.
    pub async fn fetch_keys(&self, source: &JwksSource) -> Result<Vec<serde_json::Value>, CoreError> {
        if let Some(doc) = self.cache.get_fresh(&source.url, self.ttl) {
            return Ok(extract_keys(doc));
        }

        let fetch_result = async {
            let resp = self.client.get(&source.url).send().await?;
            resp.json::<serde_json::Value>().await
        }
        .await;

        let doc = match fetch_result {
            Ok(doc) => doc,
            Err(e) => {
                if let Some(stale) = self.cache.get_stale(&source.url) {
                    tracing::warn!(source = %source.name, error = %e, "jwks fetch failed, serving stale cache entry");
                    return Ok(extract_keys(stale));
                }
                tracing::warn!(source = %source.name, error = %e, "jwks fetch failed and no cached entry to fall back on");
                return Err(CoreError::Store(format!("jwks fetch failed: {e}")));
            }
        };

        self.cache.insert(source.url.clone(), doc.clone());
        Ok(extract_keys(doc))
    }
}

fn extract_keys(doc: serde_json::Value) -> Vec<serde_json::Value> {
    doc.get("keys")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}
