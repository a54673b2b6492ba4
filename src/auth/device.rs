//! GitHub Device Code flow (RFC 8628) wire layer.
//!
//! Two-stage OAuth without a browser redirect:
//!
//! 1. Request a device code; show the user code + verification URL.
//! 2. Poll the token endpoint until the user approves, then exchange the
//!    OAuth token for a short-lived Copilot API token.
//!
//! # Endpoints
//! - Device code: `https://github.com/login/device/code`
//! - Token: `https://github.com/login/oauth/access_token`
//! - API token exchange: `https://api.github.com/copilot_internal/v2/token`

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HeaderTemplate;
use crate::error::AppError;

/// Default GitHub OAuth client ID for Copilot.
pub const CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

/// OAuth scope requested in stage 1.
pub const SCOPE: &str = "read:user";

const DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const API_KEY_URL: &str = "https://api.github.com/copilot_internal/v2/token";

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Endpoint configuration for the device flow. Injectable for tests.
#[derive(Debug, Clone)]
pub struct DeviceFlowConfig {
    pub client_id: String,
    pub device_code_url: String,
    pub token_url: String,
    pub api_key_url: String,
}

impl Default for DeviceFlowConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            device_code_url: DEVICE_CODE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            api_key_url: API_KEY_URL.to_string(),
        }
    }
}

/// A transient device-code session. The device code is a secret and is
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCodeSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenPollResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Result of a single token-endpoint poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// User hasn't completed authorization yet.
    Pending,
    /// Authorization complete; carries the OAuth access token.
    Complete(String),
}

/// Copilot API token exchange response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiTokenResponse {
    pub token: String,
    pub expires_at: i64,
    pub refresh_in: i64,
}

/// Request a device code from GitHub (stage 1).
pub async fn request_device_code(
    http: &reqwest::Client,
    flow: &DeviceFlowConfig,
    headers: &HeaderTemplate,
) -> Result<DeviceCodeSession, AppError> {
    let response = http
        .post(&flow.device_code_url)
        .header("Accept", "application/json")
        .header("User-Agent", &headers.user_agent)
        .json(&serde_json::json!({
            "client_id": flow.client_id,
            "scope": SCOPE,
        }))
        .send()
        .await
        .map_err(|e| AppError::Auth(format!("device code request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::Auth(format!(
            "device code request failed: HTTP {}",
            status.as_u16()
        )));
    }

    let session: DeviceCodeSession = response
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("failed to decode device code response: {e}")))?;

    debug!(
        user_code = %session.user_code,
        verification_uri = %session.verification_uri,
        expires_in = session.expires_in,
        interval = session.interval,
        "Device code obtained"
    );

    Ok(session)
}

/// Poll the token endpoint once.
///
/// `authorization_pending` maps to [`PollOutcome::Pending`]; any other
/// upstream `error` terminates the flow.
pub async fn poll_token_once(
    http: &reqwest::Client,
    flow: &DeviceFlowConfig,
    headers: &HeaderTemplate,
    device_code: &str,
) -> Result<PollOutcome, AppError> {
    let response = http
        .post(&flow.token_url)
        .header("Accept", "application/json")
        .header("User-Agent", &headers.user_agent)
        .json(&serde_json::json!({
            "client_id": flow.client_id,
            "device_code": device_code,
            "grant_type": DEVICE_CODE_GRANT,
        }))
        .send()
        .await
        .map_err(|e| AppError::Auth(format!("token poll failed: {e}")))?;

    let poll: TokenPollResponse = response
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("failed to decode poll response: {e}")))?;

    if let Some(token) = poll.access_token {
        if !token.is_empty() {
            return Ok(PollOutcome::Complete(token));
        }
    }

    match poll.error.as_deref() {
        Some("authorization_pending") => Ok(PollOutcome::Pending),
        Some(error) => Err(AppError::Auth(format!(
            "authorization failed: {error} - {}",
            poll.error_description.unwrap_or_default()
        ))),
        None => Err(AppError::Auth("no access token in response".to_string())),
    }
}

/// Exchange a GitHub OAuth token for a Copilot API token.
///
/// Note the header scheme: the exchange endpoint wants `token <oauth>`,
/// not `Bearer`.
pub async fn exchange_api_token(
    http: &reqwest::Client,
    flow: &DeviceFlowConfig,
    headers: &HeaderTemplate,
    github_token: &str,
) -> Result<ApiTokenResponse, AppError> {
    let prefix: String = github_token.chars().take(10).collect();
    debug!(github_token_prefix = %format!("{prefix}..."), "Requesting Copilot API token");

    let response = http
        .get(&flow.api_key_url)
        .header("Authorization", format!("token {github_token}"))
        .header("User-Agent", &headers.user_agent)
        .send()
        .await
        .map_err(|e| AppError::Network(format!("API token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Network(format!(
            "API token request failed: HTTP {} {}",
            status.as_u16(),
            body
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Auth(format!("failed to decode API token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn flow_for(server: &MockServer) -> DeviceFlowConfig {
        DeviceFlowConfig {
            client_id: CLIENT_ID.to_string(),
            device_code_url: format!("{}/login/device/code", server.uri()),
            token_url: format!("{}/login/oauth/access_token", server.uri()),
            api_key_url: format!("{}/copilot_internal/v2/token", server.uri()),
        }
    }

    #[test]
    fn test_default_flow_config() {
        let flow = DeviceFlowConfig::default();
        assert_eq!(flow.client_id, "Iv1.b507a08c87ecfe98");
        assert!(flow.device_code_url.contains("github.com"));
        assert!(flow.token_url.contains("github.com"));
        assert!(flow.api_key_url.contains("api.github.com"));
    }

    #[tokio::test]
    async fn test_request_device_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .and(body_partial_json(serde_json::json!({
                "client_id": CLIENT_ID,
                "scope": "read:user",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "dc_secret",
                "user_code": "ABCD-1234",
                "verification_uri": "https://github.com/login/device",
                "expires_in": 900,
                "interval": 5
            })))
            .mount(&server)
            .await;

        let session = request_device_code(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
        )
        .await
        .unwrap();
        assert_eq!(session.user_code, "ABCD-1234");
        assert_eq!(session.interval, 5);
    }

    #[tokio::test]
    async fn test_request_device_code_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/device/code"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = request_device_code(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }

    #[tokio::test]
    async fn test_poll_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "authorization_pending",
                "error_description": "authorization is pending"
            })))
            .mount(&server)
            .await;

        let outcome = poll_token_once(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
            "dc_secret",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, PollOutcome::Pending));
    }

    #[tokio::test]
    async fn test_poll_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "gho_token",
                "token_type": "bearer"
            })))
            .mount(&server)
            .await;

        let outcome = poll_token_once(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
            "dc_secret",
        )
        .await
        .unwrap();
        match outcome {
            PollOutcome::Complete(token) => assert_eq!(token, "gho_token"),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_poll_terminal_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "access_denied",
                "error_description": "user denied"
            })))
            .mount(&server)
            .await;

        let err = poll_token_once(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
            "dc_secret",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[tokio::test]
    async fn test_exchange_api_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/copilot_internal/v2/token"))
            .and(header("Authorization", "token gho_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "cop_token",
                "expires_at": 1760000000i64,
                "refresh_in": 1500
            })))
            .mount(&server)
            .await;

        let api = exchange_api_token(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
            "gho_token",
        )
        .await
        .unwrap();
        assert_eq!(api.token, "cop_token");
        assert_eq!(api.expires_at, 1_760_000_000);
        assert_eq!(api.refresh_in, 1500);
    }

    #[tokio::test]
    async fn test_exchange_api_token_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/copilot_internal/v2/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = exchange_api_token(
            &reqwest::Client::new(),
            &flow_for(&server),
            &HeaderTemplate::default(),
            "bad",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Network(_)));
    }
}
