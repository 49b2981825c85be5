//! Rate-limited upstream HTTP client.
//!
//! Every request passes through the shared retry policy and a tracked
//! [`RateLimiter`], so it counts against the process-wide in-flight ceiling
//! and the anomaly cool-down. Response bodies can be recorded verbatim under
//! `requests/{execution_id}/{request_id}.req` for later inspection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeworks_core::pipeline::FieldPath;
use pipeworks_core::throttle::{HttpStatus, RateLimiter, RetryPolicy, Throttle};
use pipeworks_types::config::GlobalConfig;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use uuid::Uuid;

use crate::filesystem::DataLayout;

/// Query parameter carrying the cursor of the next page.
const PAGINATION_TOKEN: &str = "pagination_token";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    #[error("invalid items path: {0}")]
    ItemsPath(String),
}

/// One upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub request_id: Uuid,
    pub status: u16,
    /// Parsed JSON, or the raw body as a JSON string when it is not JSON.
    pub body: Value,
    pub elapsed: Duration,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl HttpStatus for UpstreamResponse {
    fn status_code(&self) -> u16 {
        self.status
    }
}

/// Items gathered across pages by [`UpstreamClient::get_pages`].
#[derive(Debug, Clone, Default)]
pub struct Paged {
    pub items: Vec<Value>,
    pub pages: usize,
    /// Status of the last response received.
    pub last_status: u16,
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    limiter: RateLimiter,
    retry: RetryPolicy,
    record_dir: Option<PathBuf>,
}

impl UpstreamClient {
    /// Client for `base_url` gated by `throttle` with the `[upstream]` and
    /// `[retry]` settings of `config`.
    pub fn new(base_url: impl Into<String>, throttle: Arc<Throttle>, config: &GlobalConfig) -> Self {
        let limiter = RateLimiter::new(
            config.upstream.tag.clone(),
            config.upstream.interval(),
            Arc::clone(&throttle),
        )
        .tracked();

        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            headers: HeaderMap::new(),
            limiter,
            retry: RetryPolicy::new(&config.retry, throttle),
            record_dir: None,
        }
    }

    /// Client for one execution. With `record_responses` set, every response
    /// body is recorded under `requests/{execution_id}/` of `layout`.
    pub fn for_execution(
        base_url: impl Into<String>,
        throttle: Arc<Throttle>,
        config: &GlobalConfig,
        layout: &DataLayout,
        execution_id: Uuid,
    ) -> Self {
        let client = Self::new(base_url, throttle, config);
        if config.upstream.record_responses {
            client.record_to(layout.requests_dir(execution_id))
        } else {
            client
        }
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, UpstreamError> {
        let invalid = |message: String| UpstreamError::InvalidHeader {
            name: name.to_string(),
            message,
        };
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Record every response body into `dir`.
    pub fn record_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.record_dir = Some(dir.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str, query: &[(String, String)]) -> Result<UpstreamResponse, UpstreamError> {
        self.request(Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<UpstreamResponse, UpstreamError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// Send with retry of transient statuses. A response that is still
    /// transient after the last attempt is returned as-is.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let url = self.url(path);
        self.retry
            .run(|| self.send_once(method.clone(), &url, query, body))
            .await
    }

    /// Follow `pagination_token` cursors, collecting the array found at
    /// `items_path` in each page, for at most `max_pages` pages.
    ///
    /// Stops early on a non-success status or a page without items.
    pub async fn get_pages(
        &self,
        path: &str,
        query: &[(String, String)],
        items_path: &str,
        max_pages: usize,
    ) -> Result<Paged, UpstreamError> {
        let items_path = FieldPath::parse(items_path).map_err(|e| UpstreamError::ItemsPath(e.to_string()))?;
        let mut paged = Paged::default();
        let mut cursor: Option<String> = None;

        while paged.pages < max_pages {
            let mut params = query.to_vec();
            if let Some(token) = cursor.take() {
                params.push((PAGINATION_TOKEN.to_string(), token));
            }

            let response = self.get(path, &params).await?;
            paged.last_status = response.status;
            if !response.is_success() {
                break;
            }
            let Ok(Value::Array(items)) = items_path.resolve(&response.body) else {
                break;
            };
            paged.items.extend(items.iter().cloned());
            paged.pages += 1;

            match response.body.get(PAGINATION_TOKEN).and_then(Value::as_str) {
                Some(token) => cursor = Some(token.to_string()),
                None => break,
            }
        }

        tracing::debug!(path, pages = paged.pages, items = paged.items.len(), "pagination finished");
        Ok(paged)
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let permit = self.limiter.acquire().await;
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        let mut request = self
            .http
            .request(method.clone(), url)
            .headers(self.headers.clone())
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let elapsed = started.elapsed();
        drop(permit);

        tracing::info!(
            method = %method,
            url,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            request_id = %request_id,
            "upstream request"
        );
        if status >= 400 && status != 429 {
            tracing::warn!(request_id = %request_id, status, body = %text, "upstream error response");
        }

        self.record(request_id, &text).await;

        let body = match serde_json::from_str(&text) {
            Ok(json) => json,
            Err(_) => Value::String(text),
        };
        Ok(UpstreamResponse {
            request_id,
            status,
            body,
            elapsed,
        })
    }

    async fn record(&self, request_id: Uuid, body: &str) {
        let Some(dir) = &self.record_dir else {
            return;
        };
        let path = dir.join(format!("{request_id}.req"));
        let written = match tokio::fs::create_dir_all(dir).await {
            Ok(()) => tokio::fs::write(&path, body).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::warn!(path = %path.display(), error = %err, "failed to record upstream response");
        }
    }
}
