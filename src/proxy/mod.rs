//! Request-serving data plane.
//!
//! Every proxied request is admitted past the circuit breaker, dispatched
//! onto the worker pool, and raced against the `proxy_context` deadline.
//! The worker validates the request (method, bounded body, model sniff,
//! allow-list), obtains a valid upstream credential, executes the upstream
//! call with retry, and produces exactly one response -- streamed in 1 KiB
//! frames for SSE, buffered through the buffer pool otherwise.

pub mod breaker;
pub mod coalesce;
pub mod pool;
pub mod retry;
pub mod stream;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, request::Parts, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::auth::AuthService;
use crate::config::Config;
use crate::error::AppError;
use breaker::CircuitBreaker;
use pool::WorkerPool;
use stream::ChunkedStream;

/// Upstream completions API base.
pub const COMPLETIONS_BASE: &str = "https://api.githubcopilot.com";

/// Request bodies above this are rejected with 413.
pub const MAX_REQUEST_BODY_SIZE: usize = 5 * 1024 * 1024;

/// Buffers retained in the pool beyond this count are dropped.
const MAX_POOLED_BUFFERS: usize = 32;

// ---------------------------------------------------------------------------
// Buffer pool
// ---------------------------------------------------------------------------

/// Free list of growable byte buffers for non-streaming response copies.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer, cleared of any previous contents.
    pub fn acquire(&self) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .expect("buffer pool lock poisoned")
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf
    }

    /// Return a buffer to the free list.
    pub fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("buffer pool lock poisoned");
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy service
// ---------------------------------------------------------------------------

/// Only the model name is sniffed from the request body; the rest passes
/// through untouched.
#[derive(Debug, Deserialize)]
struct ModelProbe {
    #[serde(default)]
    model: String,
}

pub struct ProxyService {
    config: Arc<Config>,
    http: reqwest::Client,
    auth: Arc<AuthService>,
    pool: Arc<WorkerPool>,
    breaker: Arc<CircuitBreaker>,
    buffers: BufferPool,
    upstream_base: String,
}

impl ProxyService {
    pub fn new(
        config: Arc<Config>,
        http: reqwest::Client,
        auth: Arc<AuthService>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(
            config.timeouts.circuit_breaker,
        )));
        Self {
            config,
            http,
            auth,
            pool,
            breaker,
            buffers: BufferPool::new(),
            upstream_base: COMPLETIONS_BASE.to_string(),
        }
    }

    /// Point the proxy at a different completions base (tests).
    pub fn with_upstream_base(mut self, base: impl Into<String>) -> Self {
        self.upstream_base = base.into();
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Entry point for `/v1/completions` and `/v1/chat/completions`.
    ///
    /// Admission, dispatch onto the pool, then a race between the worker's
    /// single response and the request deadline. Dropping this future
    /// (client disconnect) or hitting the deadline cancels the worker's
    /// context promptly; a worker that already produced its response is
    /// unaffected.
    pub async fn handle(self: Arc<Self>, req: axum::extract::Request) -> Response {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.timeouts.proxy_context);

        if !self.breaker.allow() {
            warn!("Circuit breaker is open, rejecting request");
            return AppError::BreakerOpen.into_response();
        }

        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let (parts, body) = req.into_parts();
        let (done_tx, done_rx) = oneshot::channel::<Result<Response, AppError>>();

        let engine = Arc::clone(&self);
        let job_cancel = cancel.clone();
        let submitted = self
            .pool
            .submit(Box::pin(async move {
                let result = engine.process(parts, body, &job_cancel, deadline).await;
                let _ = done_tx.send(result);
            }))
            .await;
        if let Err(err) = submitted {
            return err.into_response();
        }

        match tokio::time::timeout_at(deadline, done_rx).await {
            Ok(Ok(Ok(response))) => response,
            Ok(Ok(Err(err))) => {
                error!(error = %err, "Worker error");
                err.into_response()
            }
            Ok(Err(_)) => {
                AppError::Internal("worker dropped without a result".to_string()).into_response()
            }
            Err(_) => {
                warn!("Request timeout in worker pool");
                AppError::Timeout.into_response()
            }
        }
    }

    /// The worker closure: full per-request pipeline, producing exactly one
    /// response.
    async fn process(
        &self,
        parts: Parts,
        body: Body,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<Response, AppError> {
        debug!(method = %parts.method, path = parts.uri.path(), "Starting proxy request");

        if parts.method != Method::POST {
            return Err(AppError::MethodNotAllowed(parts.method.to_string()));
        }

        let body = read_body_capped(body).await?;
        if body.is_empty() {
            return Err(AppError::Validation("empty request body".to_string()));
        }

        let probe: ModelProbe = serde_json::from_slice(&body)?;

        if !self.config.model_allowed(&probe.model) {
            return Err(AppError::Validation(format!(
                "model '{}' is not allowed by allowed_models in config",
                probe.model
            )));
        }

        let record = match self
            .auth
            .ensure_valid_token(&self.config.user_email, &self.config, cancel)
            .await
        {
            Ok(record) => record,
            Err(AppError::Canceled) => return Err(AppError::Canceled),
            Err(err) => {
                error!(error = %err, "Failed to ensure valid token");
                let message = match &err {
                    AppError::Auth(m) => m.clone(),
                    other => other.to_string(),
                };
                return Err(AppError::Auth(format!("token validation failed: {message}")));
            }
        };

        let target = match parts.uri.path() {
            "/v1/completions" => format!("{}/completions", self.upstream_base),
            "/v1/chat/completions" => format!("{}/chat/completions", self.upstream_base),
            other => {
                return Err(AppError::Internal(format!("unsupported proxy path: {other}")));
            }
        };
        debug!(url = %target, body_length = body.len(), "Sending request to upstream");

        let headers = &self.config.headers;
        let bearer = format!("Bearer {}", record.copilot_token);
        let build = || {
            self.http
                .post(&target)
                .header(header::AUTHORIZATION, bearer.as_str())
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::ACCEPT, "application/json")
                .header(header::USER_AGENT, headers.user_agent.as_str())
                .header("Editor-Version", headers.editor_version.as_str())
                .header("Editor-Plugin-Version", headers.editor_plugin_version.as_str())
                .header("Copilot-Integration-Id", headers.copilot_integration_id.as_str())
                .header("Openai-Intent", headers.openai_intent.as_str())
                .header("X-Initiator", headers.x_initiator.as_str())
                .body(body.clone())
        };

        // The retry executor notifies the breaker per observed outcome.
        let upstream =
            match retry::execute_with_retry(build, &self.breaker, cancel, deadline).await {
                Ok(response) => response,
                Err(err) => {
                    error!(error = %err, "Upstream request failed after retries");
                    return Err(err);
                }
            };

        debug!(
            status = upstream.status().as_u16(),
            content_type = ?upstream.headers().get(header::CONTENT_TYPE),
            "Received upstream response"
        );

        self.relay_response(upstream).await
    }

    /// Copy status and headers, apply the configured CORS overrides, and
    /// relay the body -- streamed for SSE, buffered otherwise.
    async fn relay_response(&self, upstream: reqwest::Response) -> Result<Response, AppError> {
        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        let mut headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            // Framing is re-established by this server.
            if name == header::CONTENT_LENGTH
                || name == header::TRANSFER_ENCODING
                || name == header::CONNECTION
            {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        let cors = &self.config.cors;
        if !cors.allowed_origins.is_empty() {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_str(&cors.allowed_origins.join(", "))
                    .unwrap_or_else(|_| HeaderValue::from_static("*")),
            );
        }
        if !cors.allowed_headers.is_empty() {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_str(&cors.allowed_headers.join(", "))
                    .unwrap_or_else(|_| HeaderValue::from_static("*")),
            );
        }

        let is_event_stream = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            == Some("text/event-stream");

        let body = if is_event_stream {
            debug!("Streaming upstream response");
            Body::from_stream(ChunkedStream::new(upstream.bytes_stream()))
        } else {
            Body::from(self.copy_buffered(upstream).await?)
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Buffered body copy through the pool.
    async fn copy_buffered(&self, mut upstream: reqwest::Response) -> Result<Bytes, AppError> {
        let mut buf = self.buffers.acquire();
        let result = loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break Ok(Bytes::copy_from_slice(&buf)),
                Err(err) => {
                    error!(error = %err, "Error copying upstream response");
                    break Err(AppError::Network(err.to_string()));
                }
            }
        };
        self.buffers.release(buf);
        result
    }
}

/// Read a request body, enforcing the 5 MiB cap.
async fn read_body_capped(body: Body) -> Result<Bytes, AppError> {
    match http_body_util::Limited::new(body, MAX_REQUEST_BODY_SIZE)
        .collect()
        .await
    {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) => {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                Err(AppError::PayloadTooLarge("request body too large".to_string()))
            } else {
                Err(AppError::Validation(format!(
                    "failed to read request body: {err}"
                )))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"leftover");
        let capacity = buf.capacity();
        pool.release(buf);

        // Reacquired buffer is cleared but keeps its allocation.
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), capacity);
    }

    #[test]
    fn test_buffer_pool_bounded() {
        let pool = BufferPool::new();
        for _ in 0..100 {
            pool.release(Vec::with_capacity(16));
        }
        let len = pool.free.lock().unwrap().len();
        assert!(len <= MAX_POOLED_BUFFERS);
    }

    #[tokio::test]
    async fn test_read_body_within_cap() {
        let body = Body::from(vec![b'a'; 1024]);
        let bytes = read_body_capped(body).await.unwrap();
        assert_eq!(bytes.len(), 1024);
    }

    #[tokio::test]
    async fn test_read_body_over_cap_is_payload_too_large() {
        let body = Body::from(vec![b'a'; MAX_REQUEST_BODY_SIZE + 1]);
        let err = read_body_capped(body).await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge(_)));
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(err.to_string().contains("request body too large"));
    }

    #[tokio::test]
    async fn test_read_body_exactly_at_cap() {
        let body = Body::from(vec![b'a'; MAX_REQUEST_BODY_SIZE]);
        assert!(read_body_capped(body).await.is_ok());
    }

    #[test]
    fn test_model_probe_tolerates_extra_fields() {
        let probe: ModelProbe =
            serde_json::from_slice(br#"{"model":"gpt-4o","messages":[],"stream":true}"#).unwrap();
        assert_eq!(probe.model, "gpt-4o");

        // Missing model decodes to the empty string (allow-list handles it).
        let probe: ModelProbe = serde_json::from_slice(br#"{"messages":[]}"#).unwrap();
        assert_eq!(probe.model, "");
    }
}
