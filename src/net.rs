//! Shared upstream HTTP client.

use std::time::Duration;

use crate::config::Timeouts;

/// Build the reqwest client used for all upstream traffic, configured from
/// the timeout knobs. The whole-request timeout covers streaming bodies,
/// which is why `http_client` defaults high.
pub fn build_http_client(timeouts: &Timeouts) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeouts.http_client))
        .connect_timeout(Duration::from_secs(timeouts.dial_timeout))
        .pool_idle_timeout(Duration::from_secs(timeouts.idle_conn_timeout))
        .tcp_keepalive(Duration::from_secs(timeouts.keep_alive))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to build HTTP client with custom config; using defaults");
            reqwest::Client::new()
        })
}
