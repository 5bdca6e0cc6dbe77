// Platform clients
//
// The dispatcher only sees the `PlatformClient` trait. `HttpPlatformClient` is
// the stock implementation: it POSTs the item as JSON to a configured endpoint
// and maps the HTTP status onto retryable / permanent failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::item::QueueItem;

/// Successful publish
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    /// Identifier assigned by the platform, if it returned one
    pub remote_id: Option<String>,
}

/// Failed publish, classified for retry
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    /// Transient failure (timeouts, throttling, 5xx)
    #[error("retryable publish error: {0}")]
    Retryable(String),

    /// Failure that will not go away by retrying (bad payload, auth)
    #[error("permanent publish error: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn message(&self) -> &str {
        match self {
            PublishError::Retryable(msg) | PublishError::Permanent(msg) => msg,
        }
    }
}

/// Outbound connection to one external platform
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Publish one item. Called at most once per admitted attempt.
    async fn publish(&self, item: &QueueItem) -> Result<PublishReceipt, PublishError>;
}

/// Platform clients keyed by platform
#[derive(Clone, Default)]
pub struct PlatformClients {
    clients: HashMap<String, Arc<dyn PlatformClient>>,
}

impl PlatformClients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the client for `platform`
    pub fn insert(&mut self, platform: &str, client: Arc<dyn PlatformClient>) {
        self.clients.insert(platform.to_string(), client);
    }

    /// Builder-style [`PlatformClients::insert`]
    pub fn with(mut self, platform: &str, client: Arc<dyn PlatformClient>) -> Self {
        self.insert(platform, client);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformClient>> {
        self.clients.get(platform).cloned()
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.clients.contains_key(platform)
    }

    /// Registered platforms, sorted
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<_> = self.clients.keys().cloned().collect();
        platforms.sort();
        platforms
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl std::fmt::Debug for PlatformClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClients")
            .field("platforms", &self.platforms())
            .finish()
    }
}

/// Endpoint settings for [`HttpPlatformClient`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// URL the item is POSTed to
    pub endpoint: String,

    /// Bearer token for authentication
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Extra HTTP headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Generic JSON-over-HTTP platform client
#[derive(Debug, Clone)]
pub struct HttpPlatformClient {
    platform: String,
    config: HttpClientConfig,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    id: &'a str,
    platform: &'a str,
    payload: &'a serde_json::Value,
    attempt: u32,
}

#[derive(Deserialize)]
struct PublishResponse {
    #[serde(default, alias = "remoteId")]
    remote_id: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

impl HttpPlatformClient {
    pub fn new(platform: &str, config: HttpClientConfig) -> Self {
        Self {
            platform: platform.to_string(),
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn publish(&self, item: &QueueItem) -> Result<PublishReceipt, PublishError> {
        let start = Instant::now();
        let body = PublishRequest {
            id: &item.id,
            platform: &item.platform,
            payload: &item.payload,
            attempt: item.attempts + 1,
        };

        let mut request = self.client.post(&self.config.endpoint).json(&body);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                PublishError::Permanent(e.to_string())
            } else {
                PublishError::Retryable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        debug!(
            platform = %self.platform,
            id = %item.id,
            status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Publish response"
        );

        if !(200..300).contains(&status) {
            let msg = format!("HTTP {}", status);
            return Err(if is_retryable_status(status) {
                PublishError::Retryable(msg)
            } else {
                PublishError::Permanent(msg)
            });
        }

        // An empty or non-JSON 2xx body still counts as posted
        let remote_id = response
            .json::<PublishResponse>()
            .await
            .ok()
            .and_then(|r| r.remote_id.or(r.id));
        Ok(PublishReceipt { remote_id })
    }
}

/// Check if an HTTP status code is worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    matches!(
        status,
        408 | // Request Timeout
        425 | // Too Early
        429 | // Too Many Requests
        500 | // Internal Server Error
        502 | // Bad Gateway
        503 | // Service Unavailable
        504   // Gateway Timeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl PlatformClient for Fixed {
        async fn publish(&self, _item: &QueueItem) -> Result<PublishReceipt, PublishError> {
            Ok(PublishReceipt {
                remote_id: Some("r-1".to_string()),
            })
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_clients_map() {
        let clients = PlatformClients::new()
            .with("b", Arc::new(Fixed))
            .with("a", Arc::new(Fixed));
        assert!(clients.contains("a"));
        assert!(!clients.contains("c"));
        assert_eq!(clients.platforms(), vec!["a", "b"]);
    }

    #[test]
    fn test_publish_error_message() {
        let err = PublishError::Permanent("HTTP 400".to_string());
        assert_eq!(err.message(), "HTTP 400");
        assert_eq!(err.to_string(), "permanent publish error: HTTP 400");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let client = HttpPlatformClient::new(
            "x",
            HttpClientConfig {
                // port 9 (discard) on localhost: connection refused
                endpoint: "http://127.0.0.1:9/publish".to_string(),
                ..HttpClientConfig::default()
            },
        );
        let item = QueueItem::new(
            super::super::item::NewQueueItem::new("x", serde_json::json!({})),
            chrono::Utc::now(),
        );
        let result = client.publish(&item).await;
        assert!(matches!(result, Err(PublishError::Retryable(_))));
    }
}
