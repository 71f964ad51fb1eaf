//! Outbound HTTP seam.
//!
//! The devauth client never talks to `reqwest` directly; it hands an
//! [`HttpRequest`] to an [`HttpRunner`], so tests and local setups can swap the
//! network out for a [`RecordingRunner`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    pub fn with_json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self {
            status,
            body: body.to_string().into_bytes(),
        }
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[async_trait]
pub trait HttpRunner: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// reqwest
// ─────────────────────────────────────────────────────────────────────────────

/// Production runner backed by a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestRunner {
    http: reqwest::Client,
}

impl ReqwestRunner {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpRunner for ReqwestRunner {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .http
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(format!("failed to read response body: {e}")))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Recorded {
    scripted: VecDeque<Result<HttpResponse, TransportError>>,
    requests: Vec<HttpRequest>,
}

/// In-process runner that captures every request.
///
/// Scripted replies are consumed in order; once they run out the runner answers
/// like a healthy devauth (`201` for `POST`, `204` otherwise). Clones share the
/// script and the captured requests.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    inner: Arc<Mutex<Recorded>>,
    delay: Option<Duration>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: HttpResponse) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scripted.push_back(Ok(response));
        }
    }

    pub fn push_error(&self, error: TransportError) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scripted.push_back(Err(error));
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.inner
            .lock()
            .map(|inner| inner.requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HttpRunner for RecordingRunner {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let default_status = if request.method == Method::POST {
            StatusCode::CREATED
        } else {
            StatusCode::NO_CONTENT
        };

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError("recording runner lock poisoned".to_string()))?;
        inner.requests.push(request);
        inner
            .scripted
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(default_status)))
    }
}
