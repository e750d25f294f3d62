//! Tunnelboard transport: the HTTP boundary behind everything else.
//!
//! `Transport` is the seam the session guard, cache fetchers and mutation
//! pipeline all go through. The real implementation is a thin reqwest
//! wrapper; `MockTransport` serves canned responses for tests.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use tunnelboard_core::{ApiError, ApiResult, Method, Response};

/// Stateless request/response boundary. Carries no session state; the bearer
/// credential arrives per call (normally filled in by the session guard).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Json>,
        bearer: Option<&str>,
    ) -> ApiResult<Response>;
}

fn http_timeout() -> Duration {
    let secs = std::env::var("TB_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(30);
    Duration::from_secs(secs)
}

/// Turn a raw status/body pair into the transport-level result. Non-2xx is
/// an error carrying the body through untouched; no further interpretation
/// happens at this layer.
pub fn into_result(status: u16, body: Json) -> ApiResult<Response> {
    if (200..300).contains(&status) {
        Ok(Response { status, body })
    } else {
        Err(ApiError::Http { status, body })
    }
}

fn parse_body(text: &str) -> Json {
    if text.is_empty() {
        return Json::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Json::String(text.to_string()))
}

/// reqwest-backed transport. Holds only the base URL and a client.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout())
            .build()
            .map_err(|e| ApiError::Internal(format!("building http client: {}", e)))?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Json>,
        bearer: Option<&str>,
    ) -> ApiResult<Response> {
        let rm = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut req = self.client.request(rm, self.url(path));
        if let Some(b) = body {
            req = req.json(b);
        }
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| ApiError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| ApiError::Network(e.to_string()))?;
        debug!(method = %method, path = %path, status, "transport: response");
        into_result(status, parse_body(&text))
    }
}

/// One call as seen by the mock, including the bearer it arrived with.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Json>,
    pub bearer: Option<String>,
}

/// Scriptable in-memory transport for tests. Routes are keyed by
/// `(method, path)`; unrouted calls answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<FxHashMap<(Method, String), ApiResult<Response>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, method: Method, path: &str, result: ApiResult<Response>) {
        self.routes.lock().unwrap().insert((method, path.to_string()), result);
    }

    /// Shorthand for a 200 route with the given body.
    pub fn respond_ok(&self, method: Method, path: &str, body: Json) {
        self.respond(method, path, Ok(Response { status: 200, body }));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.method == method && c.path == path).count()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Json>,
        bearer: Option<&str>,
    ) -> ApiResult<Response> {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            path: path.to_string(),
            body: body.cloned(),
            bearer: bearer.map(|s| s.to_string()),
        });
        match self.routes.lock().unwrap().get(&(method, path.to_string())) {
            Some(res) => res.clone(),
            None => Err(ApiError::Http {
                status: 404,
                body: serde_json::json!({ "detail": "not found" }),
            }),
        }
    }
}
