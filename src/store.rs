//! Client for the external credential store.
//!
//! The store is an HTTP key-value endpoint keyed by user email. It is
//! authoritative: records held by in-flight proxy requests are snapshots.
//! One asymmetry is inherited from the store itself: the integer fields
//! (`expiresAt`, `refreshIn`) arrive as JSON strings on GET but are sent as
//! numbers on POST, so decoding tolerates both.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::config::Config;

/// Per-request timeout for store operations.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve the store base URL from the environment, falling back to the
/// loopback default used in local development.
pub fn store_url_from_env() -> String {
    match std::env::var("AUTOREVIEW_UI_HOST") {
        Ok(host) if !host.is_empty() => {
            format!("http://{host}:3000/api/copilot-auth-status")
        }
        _ => "http://localhost:3000/api/copilot-auth-status".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists for the requested email. Not retriable.
    #[error("user not found in database")]
    NotFound,

    #[error("store auth error: {0}")]
    Auth(String),

    #[error("store network error: {0}")]
    Network(String),

    #[error("store decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Credential record
// ---------------------------------------------------------------------------

/// A credential record as held by the store.
///
/// Invariant: a non-empty `copilot_token` always carries a positive
/// `expires_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "githubToken", default)]
    pub github_token: String,
    #[serde(rename = "copilotToken", default)]
    pub copilot_token: String,
    #[serde(rename = "expiresAt", default, deserialize_with = "string_or_i64")]
    pub expires_at: i64,
    #[serde(rename = "refreshIn", default, deserialize_with = "string_or_i64")]
    pub refresh_in: i64,
}

impl CredentialRecord {
    /// Snapshot a record from config-seeded tokens.
    pub fn from_config(config: &Config) -> Self {
        Self {
            github_token: config.github_token.clone(),
            copilot_token: config.copilot_token.clone(),
            expires_at: config.expires_at,
            refresh_in: config.refresh_in,
        }
    }
}

/// Accept an i64 encoded either as a JSON number or as a decimal string.
fn string_or_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FetchEnvelope {
    success: bool,
    data: Option<CredentialRecord>,
}

#[derive(Debug, Serialize)]
struct UpdateBody<'a> {
    email: &'a str,
    #[serde(rename = "githubToken")]
    github_token: &'a str,
    #[serde(rename = "copilotToken")]
    copilot_token: &'a str,
    #[serde(rename = "expiresAt")]
    expires_at: i64,
    #[serde(rename = "refreshIn")]
    refresh_in: i64,
}

#[derive(Debug, Deserialize)]
struct UpdateEnvelope {
    success: bool,
}

// ---------------------------------------------------------------------------
// TokenStore
// ---------------------------------------------------------------------------

/// HTTP client for the credential store.
#[derive(Debug, Clone)]
pub struct TokenStore {
    http: reqwest::Client,
    base_url: String,
}

impl TokenStore {
    /// Create a store client with the base URL resolved from the environment.
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, store_url_from_env())
    }

    /// Create a store client against an explicit base URL.
    pub fn with_base_url(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    /// Fetch the credential record for `email`.
    pub async fn fetch(&self, email: &str) -> Result<CredentialRecord, StoreError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("email", email)])
            .header("Accept", "application/json")
            .timeout(STORE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound);
        }
        if !status.is_success() {
            return Err(StoreError::Network(format!(
                "HTTP {} response from {}",
                status.as_u16(),
                self.base_url
            )));
        }

        let envelope: FetchEnvelope = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(StoreError::Auth(
                "failed to fetch token from database".to_string(),
            ));
        }

        envelope
            .data
            .ok_or_else(|| StoreError::Decode("missing data field".to_string()))
    }

    /// Write the credential record for `email`. Last writer wins; retries
    /// are the caller's business.
    pub async fn update(&self, email: &str, record: &CredentialRecord) -> Result<(), StoreError> {
        let body = UpdateBody {
            email,
            github_token: &record.github_token,
            copilot_token: &record.copilot_token,
            expires_at: record.expires_at,
            refresh_in: record.refresh_in,
        };

        let response = self
            .http
            .post(&self.base_url)
            .header("Accept", "application/json")
            .json(&body)
            .timeout(STORE_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Network(format!(
                "HTTP {} response from {}",
                status.as_u16(),
                self.base_url
            )));
        }

        let envelope: UpdateEnvelope = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(StoreError::Auth(
                "failed to update token in database".to_string(),
            ));
        }

        tracing::info!(email = %email, "Token updated in store");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> TokenStore {
        TokenStore::with_base_url(
            reqwest::Client::new(),
            format!("{}/api/copilot-auth-status", server.uri()),
        )
    }

    #[test]
    fn test_decode_integers_as_strings() {
        // GET responses carry the integer fields as strings.
        let json = r#"{
            "email": "u@x.com",
            "githubToken": "gho_abc",
            "copilotToken": "cop_def",
            "expiresAt": "1760000000",
            "refreshIn": "1500"
        }"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.github_token, "gho_abc");
        assert_eq!(record.expires_at, 1_760_000_000);
        assert_eq!(record.refresh_in, 1500);
    }

    #[test]
    fn test_decode_integers_as_numbers() {
        let json = r#"{
            "githubToken": "gho_abc",
            "copilotToken": "cop_def",
            "expiresAt": 1760000000,
            "refreshIn": 1500
        }"#;
        let record: CredentialRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.expires_at, 1_760_000_000);
        assert_eq!(record.refresh_in, 1500);
    }

    #[test]
    fn test_encode_integers_as_numbers() {
        let record = CredentialRecord {
            github_token: "g".into(),
            copilot_token: "c".into(),
            expires_at: 42,
            refresh_in: 7,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["expiresAt"].is_i64());
        assert!(json["refreshIn"].is_i64());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/copilot-auth-status"))
            .and(query_param("email", "u@x.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": {
                    "email": "u@x.com",
                    "githubToken": "gho_abc",
                    "copilotToken": "cop_def",
                    "expiresAt": "1760000000",
                    "refreshIn": "1500"
                }
            })))
            .mount(&server)
            .await;

        let record = store_for(&server).fetch("u@x.com").await.unwrap();
        assert_eq!(record.copilot_token, "cop_def");
        assert_eq!(record.expires_at, 1_760_000_000);
    }

    #[tokio::test]
    async fn test_fetch_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/copilot-auth-status"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = store_for(&server).fetch("missing@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn test_fetch_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/copilot-auth-status"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = store_for(&server).fetch("u@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_unsuccessful_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/copilot-auth-status"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": false})),
            )
            .mount(&server)
            .await;

        let err = store_for(&server).fetch("u@x.com").await.unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
    }

    #[tokio::test]
    async fn test_update_posts_numbers() {
        let server = MockServer::start().await;
        let expected = serde_json::json!({
            "email": "u@x.com",
            "githubToken": "gho_abc",
            "copilotToken": "cop_def",
            "expiresAt": 1760000000i64,
            "refreshIn": 1500
        });
        Mock::given(method("POST"))
            .and(path("/api/copilot-auth-status"))
            .and(body_json_string(expected.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"success": true})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let record = CredentialRecord {
            github_token: "gho_abc".into(),
            copilot_token: "cop_def".into(),
            expires_at: 1_760_000_000,
            refresh_in: 1500,
        };
        store_for(&server).update("u@x.com", &record).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_failure_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/copilot-auth-status"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .update("u@x.com", &CredentialRecord::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }

    #[test]
    fn test_store_url_default() {
        // Without AUTOREVIEW_UI_HOST the loopback default applies. The env
        // var may be set in CI, so only assert the shape when it is absent.
        if std::env::var("AUTOREVIEW_UI_HOST").is_err() {
            assert_eq!(
                store_url_from_env(),
                "http://localhost:3000/api/copilot-auth-status"
            );
        }
    }
}
