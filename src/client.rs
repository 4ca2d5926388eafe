//! REST transport and client for the DigitalOcean API.
//!
//! [`Transport`] is the seam between the lifecycle engine and the network:
//! [`HttpTransport`] speaks HTTPS through `reqwest`, applies the static
//! requests-per-second ceiling and retries throttled or transiently failing
//! requests; [`MockTransport`](crate::testing::MockTransport) replays scripted
//! responses in tests. [`Client`] sits on top, attaches the bearer token, and
//! turns every non-2xx response into an [`ApiError`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::config::ProviderConfig;
use crate::context::OpContext;
use crate::error::{ApiError, ProviderError};
use crate::retry::Backoff;
use crate::types::Sensitive;

/// Statuses the HTTP layer retries on its own.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl Method {
    /// The method name on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Request payload.
#[derive(Clone, PartialEq)]
pub enum Body {
    /// `application/json`
    Json(Value),
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Json(value) => f.debug_tuple("Json").field(value).finish(),
            // form bodies carry OAuth tokens
            Body::Form(fields) => f
                .debug_list()
                .entries(fields.iter().map(|(k, _)| format!("{}=(sensitive value)", k)))
                .finish(),
        }
    }
}

/// A single API request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Path relative to the API endpoint, or an absolute URL.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Optional payload.
    pub body: Option<Body>,
    /// Bearer token; the client fills in its own when unset.
    pub bearer: Option<Sensitive<String>>,
}

impl ApiRequest {
    /// Create a request with no query, headers or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    /// Add a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set a JSON body.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    /// Set a form body.
    pub fn with_form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }

    /// Authenticate with a specific bearer token instead of the client's.
    pub fn with_bearer(mut self, token: Sensitive<String>) -> Self {
        self.bearer = Some(token);
        self
    }

    /// Look up a query parameter.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Look up a header (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The JSON body, if any.
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            Some(Body::Json(value)) => Some(value),
            _ => None,
        }
    }
}

/// A response as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers, lower-cased names.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body; `Null` when empty.
    pub body: Value,
}

impl ApiResponse {
    /// Create a response.
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    /// Add a header.
    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_ascii_lowercase(), value.into());
        self
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `Retry-After` delay, when given in seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Executes API requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return whatever status the server answered with.
    ///
    /// Only failures to obtain a response are errors.
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ProviderError>;
}

/// Static requests-per-second ceiling shared by every request of a transport.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Option<Duration>,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// Space requests at least `interval` apart; `None` disables the limit.
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Wait for the next free slot.
    pub async fn acquire(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = if *next > now { *next } else { now };
            *next = slot + interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// When the HTTP layer retries on its own.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max: u32,
    /// Delay between attempts when the server gives no `Retry-After`.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Delay before retrying a failed send, or `None` once retries are used up.
    pub fn after_send_error(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max).then(|| self.backoff.delay(attempt))
    }

    /// Delay before retrying a response, or `None` when it is final.
    pub fn after_response(&self, attempt: u32, response: &ApiResponse) -> Option<Duration> {
        if !RETRYABLE_STATUSES.contains(&response.status) || attempt >= self.max {
            return None;
        }
        Some(response.retry_after().unwrap_or_else(|| self.backoff.delay(attempt)))
    }
}

/// `reqwest`-backed transport with rate limiting and HTTP-level retries.
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
    user_agent: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base", &self.base.as_str())
            .field("limiter", &self.limiter)
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpTransport {
    /// Build a transport from the provider configuration.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base: config.api_endpoint.clone(),
            user_agent: config.user_agent(),
            limiter: RateLimiter::new(config.request_interval()?),
            retry: RetryPolicy {
                max: config.http_retry_max,
                backoff: config.http_backoff(),
            },
        })
    }

    fn url_for(&self, request: &ApiRequest) -> Result<Url, ProviderError> {
        resolve_url(&self.base, &request.path, &request.query)
    }
}

/// Resolve a relative path (or absolute URL) and append query parameters.
pub fn resolve_url(
    base: &Url,
    path: &str,
    query: &[(String, String)],
) -> Result<Url, ProviderError> {
    let mut url = if path.starts_with("http://") || path.starts_with("https://") {
        Url::parse(path)
    } else {
        base.join(path)
    }
    .map_err(|e| ProviderError::InvalidRequest(format!("invalid request path {:?}: {}", path, e)))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query.iter());
    }
    Ok(url)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ProviderError> {
        let url = self.url_for(&request)?;
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;

            let mut builder = self
                .http
                .request(request.method.into(), url.clone())
                .header(reqwest::header::USER_AGENT, &self.user_agent)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(token) = &request.bearer {
                builder = builder.bearer_auth(token.expose());
            }
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            builder = match &request.body {
                Some(Body::Json(value)) => builder.json(value),
                Some(Body::Form(fields)) => builder.form(fields),
                None => builder,
            };

            let started = Instant::now();
            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    let Some(wait) = self.retry.after_send_error(attempt) else {
                        return Err(e.into());
                    };
                    warn!(method = %request.method, path = %request.path, attempt, error = %e, "request failed, retrying in {:?}", wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                    continue;
                },
                Err(e) => return Err(e.into()),
            };

            let status = response.status().as_u16();
            let headers: HashMap<String, String> = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();
            let text = response.text().await?;
            let body = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            let api_response = ApiResponse {
                status,
                headers,
                body,
            };

            debug!(
                method = %request.method,
                path = %request.path,
                status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "api request"
            );

            if let Some(wait) = self.retry.after_response(attempt, &api_response) {
                warn!(method = %request.method, path = %request.path, status, attempt, "retryable status, retrying in {:?}", wait);
                tokio::time::sleep(wait).await;
                attempt += 1;
                continue;
            }
            return Ok(api_response);
        }
    }
}

/// Pagination links returned by list endpoints.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Links {
    /// Page URLs.
    #[serde(default)]
    pub pages: Option<Pages>,
}

/// `links.pages` of a list response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Pages {
    /// First page URL.
    #[serde(default)]
    pub first: Option<String>,
    /// Previous page URL.
    #[serde(default)]
    pub prev: Option<String>,
    /// Next page URL.
    #[serde(default)]
    pub next: Option<String>,
    /// Last page URL.
    #[serde(default)]
    pub last: Option<String>,
}

impl Links {
    /// Whether no further page follows.
    pub fn is_last_page(&self) -> bool {
        match &self.pages {
            None => true,
            Some(pages) => pages.next.as_deref().map_or(true, str::is_empty),
        }
    }
}

/// Authenticated API client shared by every resource.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    token: Sensitive<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("token", &self.token).finish()
    }
}

impl Client {
    /// Create a client over a transport.
    pub fn new(transport: Arc<dyn Transport>, token: Sensitive<String>) -> Self {
        Self { transport, token }
    }

    /// Send a request, failing on any non-2xx status.
    pub async fn execute(
        &self,
        ctx: &OpContext,
        mut request: ApiRequest,
    ) -> Result<ApiResponse, ProviderError> {
        if request.bearer.is_none() {
            request.bearer = Some(self.token.clone());
        }
        let method = request.method;
        let path = request.path.clone();
        let response = ctx.run(self.transport.execute(request)).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(api_error(method, &path, &response).into())
        }
    }

    /// GET a JSON document.
    pub async fn get(
        &self,
        ctx: &OpContext,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ProviderError> {
        let mut request = ApiRequest::new(Method::Get, path);
        for (k, v) in query {
            request = request.with_query(*k, *v);
        }
        Ok(self.execute(ctx, request).await?.body)
    }

    /// POST a JSON body.
    pub async fn post(&self, ctx: &OpContext, path: &str, body: Value) -> Result<Value, ProviderError> {
        let request = ApiRequest::new(Method::Post, path).with_json(body);
        Ok(self.execute(ctx, request).await?.body)
    }

    /// PUT a JSON body.
    pub async fn put(&self, ctx: &OpContext, path: &str, body: Value) -> Result<Value, ProviderError> {
        let request = ApiRequest::new(Method::Put, path).with_json(body);
        Ok(self.execute(ctx, request).await?.body)
    }

    /// PATCH a JSON body.
    pub async fn patch(&self, ctx: &OpContext, path: &str, body: Value) -> Result<Value, ProviderError> {
        let request = ApiRequest::new(Method::Patch, path).with_json(body);
        Ok(self.execute(ctx, request).await?.body)
    }

    /// DELETE a resource.
    pub async fn delete(
        &self,
        ctx: &OpContext,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<(), ProviderError> {
        let mut request = ApiRequest::new(Method::Delete, path);
        for (k, v) in query {
            request = request.with_query(*k, *v);
        }
        self.execute(ctx, request).await?;
        Ok(())
    }
}

/// Deserialize the object under `key` of a response envelope.
pub fn extract<T: DeserializeOwned>(body: &Value, key: &str) -> Result<T, ProviderError> {
    match body.get(key) {
        Some(value) if !value.is_null() => Ok(serde_json::from_value(value.clone())?),
        _ => Err(ProviderError::Parse(format!(
            "response is missing the `{}` field",
            key
        ))),
    }
}

fn api_error(method: Method, path: &str, response: &ApiResponse) -> ApiError {
    let message = response
        .body
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| response.body.as_str().map(str::to_string))
        .or_else(|| {
            reqwest::StatusCode::from_u16(response.status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let error = ApiError::new(method.as_str(), path, response.status, message);
    match response.body.get("id").and_then(Value::as_str) {
        Some(id) => error.with_id(id),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use serde_json::json;

    #[test]
    fn test_resolve_url() {
        let base = Url::parse("https://api.digitalocean.com").unwrap();
        let url = resolve_url(
            &base,
            "/v2/nfs/abc",
            &[("region".to_string(), "atl1".to_string())],
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://api.digitalocean.com/v2/nfs/abc?region=atl1");

        let absolute = resolve_url(&base, "https://cloud.digitalocean.com/v1/oauth/revoke", &[]).unwrap();
        assert_eq!(absolute.host_str(), Some("cloud.digitalocean.com"));
    }

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max,
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }

    #[test]
    fn test_retry_policy_statuses_and_cap() {
        let retry = policy(4);
        let throttled = ApiResponse::new(429, Value::Null);
        assert_eq!(retry.after_response(0, &throttled), Some(Duration::from_secs(1)));
        assert_eq!(retry.after_response(3, &throttled), Some(Duration::from_secs(8)));
        assert_eq!(retry.after_response(4, &throttled), None);

        let unavailable = ApiResponse::new(503, Value::Null);
        assert_eq!(retry.after_response(1, &unavailable), Some(Duration::from_secs(2)));
        assert_eq!(retry.after_response(0, &ApiResponse::new(404, Value::Null)), None);
        assert_eq!(retry.after_response(0, &ApiResponse::new(200, Value::Null)), None);

        assert_eq!(retry.after_send_error(3), Some(Duration::from_secs(8)));
        assert_eq!(retry.after_send_error(4), None);
        assert_eq!(policy(0).after_response(0, &throttled), None);
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let throttled = ApiResponse::new(429, Value::Null).with_header("Retry-After", "3");
        assert_eq!(policy(4).after_response(2, &throttled), Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Some(Duration::from_millis(500)));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(1000));

        let unlimited = RateLimiter::new(None);
        let start = Instant::now();
        unlimited.acquire().await;
        unlimited.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_does_not_delay() {
        let limiter = RateLimiter::new(Some(Duration::from_millis(500)));
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_transport_rejects_unusable_rate() {
        let mut config = ProviderConfig::for_endpoint("t", Url::parse("https://api.digitalocean.com").unwrap());
        config.requests_per_second = 1e-30;
        let err = HttpTransport::new(&config).unwrap_err();
        assert!(matches!(err, ProviderError::Configuration(_)));
    }

    #[test]
    fn test_links_last_page() {
        assert!(Links::default().is_last_page());
        let links: Links = serde_json::from_value(json!({"pages": {"next": "https://x/?page=2"}})).unwrap();
        assert!(!links.is_last_page());
        let links: Links = serde_json::from_value(json!({"pages": {"prev": "https://x/?page=1"}})).unwrap();
        assert!(links.is_last_page());
    }

    #[test]
    fn test_retry_after_header() {
        let response = ApiResponse::new(429, Value::Null).with_header("Retry-After", "3");
        assert_eq!(response.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_form_body_debug_is_redacted() {
        let body = Body::Form(vec![("token".to_string(), "secret".to_string())]);
        let printed = format!("{:?}", body);
        assert!(!printed.contains("secret"));
        assert!(printed.contains("token="));
    }

    #[tokio::test]
    async fn test_client_maps_api_errors() {
        let mock = MockTransport::new().on(
            Method::Get,
            "/v2/vpcs/missing",
            404,
            json!({"id": "not_found", "message": "The resource you were accessing could not be found."}),
        );
        let client = mock.client();
        let err = client
            .get(&OpContext::new(), "/v2/vpcs/missing", &[])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        match err {
            ProviderError::Api(api) => {
                assert_eq!(api.status, 404);
                assert_eq!(api.id.as_deref(), Some("not_found"));
                assert_eq!(api.method, "GET");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_sends_bearer_token() {
        let mock = MockTransport::new().on(Method::Get, "/v2/account", 200, json!({"account": {}}));
        let client = mock.client();
        client.get(&OpContext::new(), "/v2/account", &[]).await.unwrap();
        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].bearer.as_ref().map(|t| t.expose().as_str()),
            Some(MockTransport::TOKEN)
        );
    }

    #[test]
    fn test_extract() {
        let body = json!({"vpc": {"id": "v1"}});
        let vpc: Value = extract(&body, "vpc").unwrap();
        assert_eq!(vpc["id"], "v1");
        assert!(matches!(
            extract::<Value>(&body, "nfs"),
            Err(ProviderError::Parse(_))
        ));
    }
}
