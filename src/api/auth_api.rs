//! Authentication endpoints for the device flow.
//!
//! Stage 1 issues a device code for the caller to display; stage 2
//! completes the flow either by backend polling (`poll_mode=true`) or a
//! single check whose pending outcome is reported as 202 so a browser can
//! poll. The combined endpoint runs both stages with backend polling.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::auth::DeviceCodeSession;
use crate::config::is_valid_email;
use crate::error::AppError;
use crate::store::CredentialRecord;
use crate::AppState;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Stage1Request {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct Stage1Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<DeviceCodeSession>,
}

#[derive(Debug, Deserialize)]
pub struct Stage2Request {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub device_code: String,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub poll_mode: bool,
}

#[derive(Debug, Serialize)]
pub struct TokenData {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copilot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_in: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct Stage2Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
pub struct AuthenticateRequest {
    #[serde(default)]
    pub email: String,
}

impl TokenData {
    fn from_record(email: &str, record: &CredentialRecord) -> Self {
        Self {
            email: email.to_string(),
            copilot_token: Some(record.copilot_token.clone()),
            expires_at: Some(record.expires_at),
            refresh_in: Some(record.refresh_in),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /v1/auth/github/stage1
pub async fn stage1(
    State(state): State<AppState>,
    Json(request): Json<Stage1Request>,
) -> Response {
    if let Err(response) = validate_email_field(&request.email, stage1_error) {
        return response;
    }

    info!(email = %request.email, "Starting authentication stage 1");
    match state.auth.stage1(&state.config).await {
        Ok(session) => {
            info!(email = %request.email, user_code = %session.user_code, "Stage 1 successful");
            (
                StatusCode::OK,
                Json(Stage1Response {
                    success: true,
                    message: Some("device code generated successfully".to_string()),
                    error: None,
                    data: Some(session),
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!(email = %request.email, error = %err, "Stage 1 failed");
            stage1_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// POST /v1/auth/github/stage2
pub async fn stage2(
    State(state): State<AppState>,
    Json(request): Json<Stage2Request>,
) -> Response {
    if let Err(response) = validate_email_field(&request.email, stage2_error) {
        return response;
    }
    if request.device_code.is_empty() {
        return stage2_error(StatusCode::BAD_REQUEST, "device_code is required".to_string());
    }
    if request.interval == 0 {
        return stage2_error(StatusCode::BAD_REQUEST, "interval must be positive".to_string());
    }

    info!(email = %request.email, poll_mode = request.poll_mode, "Starting authentication stage 2");

    // Poll mode over HTTP is capped by the same deadline as proxied
    // requests so the connection never outlives the server write timeout.
    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.timeouts.proxy_context);
    let cancel = CancellationToken::new();

    let result = state
        .auth
        .stage2(
            &request.email,
            &request.device_code,
            request.interval,
            request.expires_in,
            &state.config,
            request.poll_mode,
            &cancel,
            deadline,
        )
        .await;

    match result {
        Ok(record) => {
            info!(email = %request.email, "Stage 2 successful");
            (
                StatusCode::OK,
                Json(Stage2Response {
                    success: true,
                    message: Some("authentication completed successfully".to_string()),
                    error: None,
                    data: Some(TokenData::from_record(&request.email, &record)),
                }),
            )
                .into_response()
        }
        Err(AppError::AuthPending) if !request.poll_mode => {
            info!(email = %request.email, "Stage 2 pending");
            (
                StatusCode::ACCEPTED,
                Json(Stage2Response {
                    success: false,
                    message: None,
                    error: Some("authorization_pending".to_string()),
                    data: None,
                }),
            )
                .into_response()
        }
        Err(err) => {
            error!(email = %request.email, error = %err, "Stage 2 failed");
            stage2_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// POST /v1/auth/github
///
/// Combined stage 1 + stage 2 with backend polling.
pub async fn authenticate(
    State(state): State<AppState>,
    Json(request): Json<AuthenticateRequest>,
) -> Response {
    if let Err(response) = validate_email_field(&request.email, stage2_error) {
        return response;
    }

    info!(email = %request.email, "Starting combined authentication");

    let deadline = tokio::time::Instant::now()
        + Duration::from_secs(state.config.timeouts.proxy_context);
    let cancel = CancellationToken::new();

    let record = match state
        .auth
        .authenticate(&request.email, &state.config, &cancel, deadline)
        .await
    {
        Ok(Some(record)) => Some(record),
        Ok(None) => None,
        Err(err) => {
            error!(email = %request.email, error = %err, "Authentication failed");
            return stage2_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    };

    // When the flow was skipped (token still valid) the store holds the
    // authoritative record.
    let record = match record {
        Some(record) => record,
        None => match state.auth.store().fetch(&request.email).await {
            Ok(record) => record,
            Err(err) => {
                error!(email = %request.email, error = %err, "Failed to fetch token after authentication");
                return stage2_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "authentication succeeded but failed to retrieve token info".to_string(),
                );
            }
        },
    };

    info!(email = %request.email, "Authentication successful");
    (
        StatusCode::OK,
        Json(Stage2Response {
            success: true,
            message: Some("authentication successful".to_string()),
            error: None,
            data: Some(TokenData::from_record(&request.email, &record)),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_email_field(
    email: &str,
    reply: fn(StatusCode, String) -> Response,
) -> Result<(), Response> {
    if email.is_empty() {
        return Err(reply(StatusCode::BAD_REQUEST, "email is required".to_string()));
    }
    if !is_valid_email(email) {
        return Err(reply(StatusCode::BAD_REQUEST, "invalid email format".to_string()));
    }
    Ok(())
}

fn stage1_error(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(Stage1Response {
            success: false,
            message: None,
            error: Some(message),
            data: None,
        }),
    )
        .into_response()
}

fn stage2_error(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(Stage2Response {
            success: false,
            message: None,
            error: Some(message),
            data: None,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
