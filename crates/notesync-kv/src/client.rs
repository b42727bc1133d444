use std::time::Duration;

use notesync_core::SyncError;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use tracing::{debug, instrument};

/// Shortest expiry the KV API accepts.
const MIN_EXPIRATION_TTL_SECS: u64 = 60;

/// Cloudflare KV REST API client.
///
/// Uses the Cloudflare API v4 to read and write one KV namespace. Transport
/// failures surface as `SyncError::Network`, error statuses as
/// `SyncError::Persistence`, so callers can fail over on either.
#[derive(Debug, Clone)]
pub struct KvClient {
    http_client: HttpClient,
    base_url: String,
    api_token: String,
}

#[derive(Debug, Deserialize)]
struct ListKeysResponse {
    #[serde(default)]
    result: Vec<KeyName>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct KeyName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

impl KvClient {
    /// Create a client for a namespace on the public Cloudflare API.
    pub fn new(account_id: &str, namespace_id: &str, api_token: String) -> Self {
        Self::with_base_url(
            format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/storage/kv/namespaces/{}",
                account_id, namespace_id
            ),
            api_token,
        )
    }

    /// Create a client against an explicit namespace URL.
    pub fn with_base_url(base_url: impl Into<String>, api_token: String) -> Self {
        Self {
            http_client: HttpClient::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.base_url, urlencoding::encode(key))
    }

    async fn failure(operation: &str, response: reqwest::Response) -> SyncError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return SyncError::RateLimited(format!("KV {} throttled: {}", operation, text));
        }
        SyncError::Persistence(format!(
            "KV {} failed with status {}: {}",
            operation, status, text
        ))
    }

    /// Get a value from KV.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        let response = self
            .http_client
            .get(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("KV GET request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!("KV key not found: {}", key);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::failure("GET", response).await);
        }

        // KV GET returns the raw value, not a JSON envelope
        let value = response
            .text()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to read KV response: {}", e)))?;

        debug!("KV GET {} ({} bytes)", key, value.len());
        Ok(Some(value))
    }

    /// Put a value to KV, optionally expiring it after `ttl`.
    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), SyncError> {
        let mut request = self
            .http_client
            .put(self.value_url(key))
            .bearer_auth(&self.api_token)
            .header("Content-Type", "text/plain")
            .body(value.to_string());
        if let Some(ttl) = ttl {
            let secs = ttl.as_secs().max(MIN_EXPIRATION_TTL_SECS);
            request = request.query(&[("expiration_ttl", secs)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("KV PUT request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::failure("PUT", response).await);
        }

        debug!("KV PUT {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Delete a value from KV.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<bool, SyncError> {
        let response = self
            .http_client
            .delete(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("KV DELETE request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::failure("DELETE", response).await);
        }

        debug!("KV DELETE {}", key);
        Ok(true)
    }

    /// List every key with the given prefix, following pagination cursors.
    #[instrument(skip(self), level = "debug")]
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, SyncError> {
        let url = format!("{}/keys", self.base_url);
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = self
                .http_client
                .get(&url)
                .bearer_auth(&self.api_token)
                .query(&[("prefix", prefix)]);
            if let Some(cursor) = &cursor {
                request = request.query(&[("cursor", cursor.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| SyncError::Network(format!("KV LIST request failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(Self::failure("LIST", response).await);
            }

            let page: ListKeysResponse = response
                .json()
                .await
                .map_err(|e| SyncError::Serialization(format!("Invalid KV LIST response: {}", e)))?;
            keys.extend(page.result.into_iter().map(|k| k.name));

            cursor = page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        debug!("KV LIST {} ({} keys)", prefix, keys.len());
        Ok(keys)
    }
}
