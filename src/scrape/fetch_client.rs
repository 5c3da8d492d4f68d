//! Typed client for the headless-browser fetch service.
//!
//! Wraps the scrape and extract endpoints with retry/backoff and splits
//! failures into retryable (transport errors, 429/5xx) and terminal kinds.
//! The transport is a trait so tests can script responses.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::ScrapeError;

const RETRYABLE_STATUS: &[u16] = &[429, 500, 502, 503, 504];
/// Cache window accepted from the fetch service (4 hours).
const MAX_AGE_MS: u64 = 14_400_000;

/// Where a result came from: the scrape endpoint or the extract fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Scrape,
    Extract,
}

impl FetchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchSource::Scrape => "scrape",
            FetchSource::Extract => "extract",
        }
    }
}

/// A fetched page in the formats the service produced.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub markdown: Option<String>,
    pub html: Option<String>,
    pub raw_html: Option<String>,
    pub metadata: Value,
    pub source: FetchSource,
}

impl FetchResult {
    /// Best-available content: markdown, else html, else raw html.
    pub fn best_content(&self) -> &str {
        self.markdown
            .as_deref()
            .or(self.html.as_deref())
            .or(self.raw_html.as_deref())
            .unwrap_or("")
    }

    /// Raw-leaning content for parsers that read script tags.
    pub fn raw_content(&self) -> &str {
        self.raw_html
            .as_deref()
            .or(self.html.as_deref())
            .or(self.markdown.as_deref())
            .unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.markdown.is_none() && self.html.is_none() && self.raw_html.is_none()
    }

    pub fn suffix(&self) -> &'static str {
        if self.markdown.is_some() {
            "md"
        } else {
            "html"
        }
    }
}

/// HTTP response as seen by the retry loop.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
}

/// Transport seam: one JSON POST per call.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn post_json(&self, path: &str, body: &Value) -> Result<TransportResponse, String>;
}

/// reqwest-backed transport with connection pooling.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(HttpTransport {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl FetchTransport for HttpTransport {
    async fn post_json(&self, path: &str, body: &Value) -> Result<TransportResponse, String> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        Ok(TransportResponse { status, body })
    }
}

/// Scrape-service client with retry/backoff.
pub struct FetchClient {
    transport: Box<dyn FetchTransport>,
    max_attempts: usize,
    backoff_base: Duration,
}

fn scrape_options() -> Value {
    json!({
        "onlyMainContent": true,
        "removeBase64Images": true,
        "skipTlsVerification": true,
        "storeInCache": true,
        "blockAds": true,
        "maxAge": MAX_AGE_MS,
        "formats": ["markdown", "html"],
    })
}

impl FetchClient {
    pub fn new(transport: Box<dyn FetchTransport>, max_attempts: usize) -> Self {
        FetchClient {
            transport,
            max_attempts: max_attempts.max(1),
            backoff_base: Duration::from_millis(500),
        }
    }

    /// Fetch a page, optionally falling back to the extract endpoint when
    /// scrape produced neither markdown nor html. `proxy` is a per-dealer
    /// hint (e.g. "stealth") passed through to the service.
    pub async fn fetch(
        &self,
        url: &str,
        allow_extract_fallback: bool,
        proxy: Option<&str>,
    ) -> Result<FetchResult, ScrapeError> {
        let document = self.scrape(url, proxy).await?;
        if document.markdown.is_some() || document.html.is_some() || !allow_extract_fallback {
            return Ok(document);
        }
        debug!(url, "scrape yielded no content, trying extract fallback");
        match self.extract(url).await? {
            Some(extracted) => Ok(extracted),
            None => Ok(document),
        }
    }

    async fn scrape(&self, url: &str, proxy: Option<&str>) -> Result<FetchResult, ScrapeError> {
        let mut payload = scrape_options();
        payload["url"] = json!(url);
        if let Some(proxy) = proxy {
            payload["proxy"] = json!(proxy);
        }

        let body = self.post_with_retry("/v2/scrape", &payload).await?;
        if body.get("success").and_then(Value::as_bool) != Some(true) {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("scrape request failed");
            return Err(ScrapeError::FetchTerminal(message.to_string()));
        }
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        Ok(FetchResult {
            url: url.to_string(),
            markdown: string_field(&data, "markdown"),
            html: string_field(&data, "html"),
            raw_html: string_field(&data, "rawHtml").or_else(|| string_field(&data, "raw_html")),
            metadata: data.get("metadata").cloned().unwrap_or(Value::Null),
            source: FetchSource::Scrape,
        })
    }

    async fn extract(&self, url: &str) -> Result<Option<FetchResult>, ScrapeError> {
        let payload = json!({
            "urls": [url],
            "scrapeOptions": scrape_options(),
        });
        let body = self.post_with_retry("/v2/extract", &payload).await?;

        if let Some(status) = body.get("status").and_then(Value::as_str) {
            if status != "completed" {
                let message = body
                    .get("error")
                    .and_then(Value::as_str)
                    .map(String::from)
                    .unwrap_or_else(|| format!("extract status {status}"));
                return Err(ScrapeError::FetchTerminal(message));
            }
        }

        let data = match body.get("data") {
            Some(data) if !data.is_null() => data,
            _ => return Ok(None),
        };

        // The extract payload may be an object or a list, possibly wrapping
        // nested documents.
        let mut candidate = match data {
            Value::Object(_) => data.clone(),
            Value::Array(items) => match items.iter().find(|item| item.is_object()) {
                Some(item) => item.clone(),
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        if let Some(documents) = candidate.get("documents").and_then(Value::as_array) {
            if let Some(first) = documents.first() {
                candidate = first.clone();
            }
        }

        let mut markdown = string_field(&candidate, "markdown");
        let html = string_field(&candidate, "html");
        let raw_html = string_field(&candidate, "rawHtml");
        if markdown.is_none() && html.is_none() && raw_html.is_none() {
            markdown = string_field(&candidate, "content");
        }

        Ok(Some(FetchResult {
            url: url.to_string(),
            markdown,
            html,
            raw_html,
            metadata: candidate.get("metadata").cloned().unwrap_or(Value::Null),
            source: FetchSource::Extract,
        }))
    }

    async fn post_with_retry(&self, path: &str, payload: &Value) -> Result<Value, ScrapeError> {
        let mut last_error: Option<ScrapeError> = None;

        for attempt in 0..self.max_attempts {
            match self.transport.post_json(path, payload).await {
                Err(transport_error) => {
                    warn!(path, attempt, error = %transport_error, "fetch transport error");
                    last_error = Some(ScrapeError::FetchRetryable(transport_error));
                }
                Ok(response) if RETRYABLE_STATUS.contains(&response.status) => {
                    warn!(path, attempt, status = response.status, "retryable fetch status");
                    last_error = Some(ScrapeError::FetchRetryable(format!(
                        "fetch service returned {} for {}",
                        response.status, path
                    )));
                }
                Ok(response) if response.status >= 400 => {
                    return Err(ScrapeError::FetchTerminal(format!(
                        "fetch service returned {} for {}",
                        response.status, path
                    )));
                }
                Ok(response) => {
                    if response.body.is_null() {
                        return Err(ScrapeError::FetchTerminal(
                            "invalid JSON from fetch service".to_string(),
                        ));
                    }
                    return Ok(response.body);
                }
            }

            if attempt + 1 < self.max_attempts {
                self.backoff(attempt).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| ScrapeError::FetchTerminal("fetch request failed".to_string())))
    }

    async fn backoff(&self, attempt: usize) {
        let base = self.backoff_base.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.3);
        sleep(Duration::from_secs_f64(base + jitter)).await;
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Scripted transport: pops one canned response per call.
    struct ScriptedTransport {
        responses: Mutex<Vec<Result<TransportResponse, String>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, String>>) -> Self {
            ScriptedTransport {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FetchTransport for ScriptedTransport {
        async fn post_json(&self, path: &str, body: &Value) -> Result<TransportResponse, String> {
            self.calls.lock().push((path.to_string(), body.clone()));
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                panic!("no scripted responses remaining for {path}");
            }
            responses.remove(0)
        }
    }

    /// Hands the boxed client a handle while the test keeps another for
    /// inspecting recorded calls.
    struct SharedTransport(Arc<ScriptedTransport>);

    #[async_trait]
    impl FetchTransport for SharedTransport {
        async fn post_json(&self, path: &str, body: &Value) -> Result<TransportResponse, String> {
            self.0.post_json(path, body).await
        }
    }

    fn ok_scrape(markdown: &str) -> TransportResponse {
        TransportResponse {
            status: 200,
            body: json!({"success": true, "data": {"markdown": markdown}}),
        }
    }

    #[tokio::test]
    async fn scrape_returns_markdown() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_scrape("# page"))]));
        let client = FetchClient::new(Box::new(SharedTransport(Arc::clone(&transport))), 2);
        let result = client.fetch("https://dealer.test", false, None).await.unwrap();
        assert_eq!(result.best_content(), "# page");
        assert_eq!(result.source, FetchSource::Scrape);
        assert_eq!(result.suffix(), "md");

        let calls = transport.calls.lock();
        let (path, body) = &calls[0];
        assert_eq!(path, "/v2/scrape");
        assert_eq!(body["url"], json!("https://dealer.test"));
        assert_eq!(body["maxAge"], json!(14_400_000u64));
        assert_eq!(body["formats"], json!(["markdown", "html"]));
        assert!(body.get("proxy").is_none());
    }

    #[tokio::test]
    async fn proxy_hint_is_forwarded() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ok_scrape("# page"))]));
        let client = FetchClient::new(Box::new(SharedTransport(Arc::clone(&transport))), 2);
        client
            .fetch("https://dealer.test", false, Some("stealth"))
            .await
            .unwrap();

        let calls = transport.calls.lock();
        assert_eq!(calls[0].1["proxy"], json!("stealth"));
    }

    #[tokio::test]
    async fn retries_429_then_succeeds() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse {
                status: 429,
                body: Value::Null,
            }),
            Ok(ok_scrape("# recovered")),
        ]);
        let mut client = FetchClient::new(Box::new(transport), 2);
        client.backoff_base = Duration::from_millis(1);

        let result = client.fetch("https://dealer.test", false, None).await.unwrap();
        assert_eq!(result.best_content(), "# recovered");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_retryable_error() {
        let retryable = || {
            Ok(TransportResponse {
                status: 503,
                body: Value::Null,
            })
        };
        let mut client =
            FetchClient::new(Box::new(ScriptedTransport::new(vec![retryable(), retryable()])), 2);
        client.backoff_base = Duration::from_millis(1);

        let err = client.fetch("https://dealer.test", false, None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn non_retryable_status_is_terminal() {
        let client = FetchClient::new(
            Box::new(ScriptedTransport::new(vec![Ok(TransportResponse {
                status: 403,
                body: Value::Null,
            })])),
            2,
        );
        let err = client.fetch("https://dealer.test", false, None).await.unwrap_err();
        assert!(matches!(err, ScrapeError::FetchTerminal(_)));
    }

    #[tokio::test]
    async fn extract_fallback_unwraps_documents() {
        let transport = ScriptedTransport::new(vec![
            Ok(TransportResponse {
                status: 200,
                body: json!({"success": true, "data": {}}),
            }),
            Ok(TransportResponse {
                status: 200,
                body: json!({
                    "status": "completed",
                    "data": [{"documents": [{"markdown": "# extracted"}]}]
                }),
            }),
        ]);
        let client = FetchClient::new(Box::new(transport), 2);

        let result = client.fetch("https://dealer.test", true, None).await.unwrap();
        assert_eq!(result.best_content(), "# extracted");
        assert_eq!(result.source, FetchSource::Extract);
    }

    #[tokio::test]
    async fn empty_scrape_without_fallback_opt_in_returns_empty() {
        let client = FetchClient::new(
            Box::new(ScriptedTransport::new(vec![Ok(TransportResponse {
                status: 200,
                body: json!({"success": true, "data": {}}),
            })])),
            2,
        );
        let result = client.fetch("https://dealer.test", false, None).await.unwrap();
        assert!(result.is_empty());
    }
}
