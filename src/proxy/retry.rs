//! Retry loop for upstream requests.
//!
//! A response is retried iff its status is 5xx, 429, or 408; transport
//! errors are always retried. Waits between attempts grow quadratically
//! (1 s, 4 s) and are context-aware: cancellation or the request deadline
//! interrupts the wait immediately. Every attempt rebuilds the request so
//! the body is re-readable. After the final attempt the last response is
//! returned regardless of status -- the client sees the upstream failure
//! code.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::proxy::breaker::CircuitBreaker;

/// Total attempts per upstream exchange.
pub const MAX_ATTEMPTS: u32 = 3;

const BASE_RETRY_DELAY_SECS: u64 = 1;

/// Whether an upstream status code warrants another attempt.
pub fn is_retriable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// Backoff before retry number `attempt` (1-based): `1·n²` seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(BASE_RETRY_DELAY_SECS * u64::from(attempt * attempt))
}

/// Execute `build()` up to [`MAX_ATTEMPTS`] times.
///
/// `build` must produce a fresh, fully-formed request each call (original
/// headers, fresh body). Every observed outcome notifies the breaker: a
/// transport error or 5xx records a failure, anything below 500 records a
/// success. The deadline is the per-request `proxy_context` bound; both it
/// and `cancel` abort a pending backoff wait.
pub async fn execute_with_retry<B>(
    build: B,
    breaker: &CircuitBreaker,
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
) -> Result<reqwest::Response, AppError>
where
    B: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err: Option<reqwest::Error> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        debug!(attempt, max_attempts = MAX_ATTEMPTS, "Upstream request attempt");

        match build().send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 500 {
                    breaker.record_success();
                } else {
                    breaker.record_failure();
                }
                if !is_retriable_status(status) {
                    debug!(attempt, status, "Upstream request done");
                    return Ok(response);
                }
                if attempt == MAX_ATTEMPTS {
                    warn!(attempt, status, "Upstream request failed after max attempts");
                    return Ok(response);
                }
                warn!(attempt, status, "Upstream request failed, retrying");
                drop(response);
            }
            Err(err) => {
                breaker.record_failure();
                if attempt == MAX_ATTEMPTS {
                    warn!(attempt, error = %err, "Upstream request failed after max attempts");
                    return Err(AppError::Network(err.to_string()));
                }
                warn!(attempt, error = %err, "Upstream request failed, retrying");
                last_err = Some(err);
            }
        }

        wait_backoff(backoff_delay(attempt), cancel, deadline).await?;
    }

    // The loop always returns from its final iteration.
    Err(AppError::Network(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string()),
    ))
}

/// Context-aware backoff wait.
async fn wait_backoff(
    delay: Duration,
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
) -> Result<(), AppError> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        () = cancel.cancelled() => Err(AppError::Canceled),
        _ = tokio::time::sleep_until(deadline) => Err(AppError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
