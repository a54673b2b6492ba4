//! Authentication service for the Copilot upstream.
//!
//! Owns the two-stage device flow, the OAuth-to-API-token exchange, and
//! proactive refresh. Credential records live in the external store keyed by
//! user email; when no email is configured the service runs on a single
//! process-level record seeded from the config (env tokens).

pub mod device;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::store::{CredentialRecord, TokenStore};

pub use device::{DeviceCodeSession, DeviceFlowConfig};

/// Refresh when the token expires within this many seconds.
pub const REFRESH_BUFFER_SECS: i64 = 300;

/// Skip re-authentication when the token is valid for at least this long.
const REAUTH_SKEW_SECS: i64 = 60;

const MAX_REFRESH_ATTEMPTS: u32 = 3;
const BASE_REFRESH_DELAY_SECS: u64 = 2;

/// Test seam: replaces the network refresh loop entirely.
pub type RefreshFn =
    Arc<dyn Fn(&mut CredentialRecord) -> Result<(), AppError> + Send + Sync>;

/// Whether a token with the given expiry needs a proactive refresh at `now`.
pub fn needs_refresh(expires_at: i64, now: i64) -> bool {
    expires_at <= now + REFRESH_BUFFER_SECS
}

/// Authentication service.
pub struct AuthService {
    http: reqwest::Client,
    store: TokenStore,
    flow: DeviceFlowConfig,
    refresh_override: Option<RefreshFn>,
    /// Process-level credential used when no user email is configured.
    seed: RwLock<Option<CredentialRecord>>,
}

impl AuthService {
    pub fn new(http: reqwest::Client, store: TokenStore) -> Self {
        Self {
            http,
            store,
            flow: DeviceFlowConfig::default(),
            refresh_override: None,
            seed: RwLock::new(None),
        }
    }

    /// Override the device-flow endpoints (tests).
    pub fn with_flow_config(mut self, flow: DeviceFlowConfig) -> Self {
        self.flow = flow;
        self
    }

    /// Inject a refresh routine that replaces the network retry loop.
    pub fn with_refresh_override(mut self, f: RefreshFn) -> Self {
        self.refresh_override = Some(f);
        self
    }

    /// The credential store backing this service.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    // -- stage 1 ---------------------------------------------------------

    /// Start the device flow and return the session for the caller to
    /// display.
    pub async fn stage1(&self, config: &Config) -> Result<DeviceCodeSession, AppError> {
        let session =
            device::request_device_code(&self.http, &self.flow, &config.headers).await?;
        info!(
            user_code = %session.user_code,
            expires_in = session.expires_in,
            "Device code generated"
        );
        Ok(session)
    }

    // -- stage 2 ---------------------------------------------------------

    /// Complete the device flow and persist the resulting credential.
    ///
    /// `poll_mode` selects backend polling (CLI-style) versus a single
    /// check whose `authorization_pending` outcome surfaces as
    /// [`AppError::AuthPending`]. The poll loop honors `cancel` and the
    /// caller-supplied `deadline`.
    #[allow(clippy::too_many_arguments)]
    pub async fn stage2(
        &self,
        email: &str,
        device_code: &str,
        interval: u64,
        expires_in: u64,
        config: &Config,
        poll_mode: bool,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<CredentialRecord, AppError> {
        let github_token = if poll_mode {
            info!(interval, expires_in, "Polling for GitHub token");
            self.poll_for_token(config, device_code, interval, expires_in, cancel, deadline)
                .await?
        } else {
            self.check_token_once(config, device_code).await?
        };

        let api =
            device::exchange_api_token(&self.http, &self.flow, &config.headers, &github_token)
                .await?;

        let record = CredentialRecord {
            github_token,
            copilot_token: api.token,
            expires_at: api.expires_at,
            refresh_in: api.refresh_in,
        };
        self.store.update(email, &record).await?;

        info!(email = %email, "Authentication successful");
        Ok(record)
    }

    /// Combined stage 1 + stage 2 with backend polling. Skips the flow
    /// entirely when the configured token is still comfortably valid.
    pub async fn authenticate(
        &self,
        email: &str,
        config: &Config,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<Option<CredentialRecord>, AppError> {
        let now = chrono::Utc::now().timestamp();
        if !config.copilot_token.is_empty() && config.expires_at > now + REAUTH_SKEW_SECS {
            info!(expires_in = config.expires_at - now, "Token still valid");
            return Ok(None);
        }

        let session = self.stage1(config).await?;
        info!(
            verification_uri = %session.verification_uri,
            user_code = %session.user_code,
            "Waiting for user authorization"
        );

        let record = self
            .stage2(
                email,
                &session.device_code,
                session.interval,
                session.expires_in,
                config,
                true,
                cancel,
                deadline,
            )
            .await?;
        Ok(Some(record))
    }

    /// Poll the token endpoint at `interval`-second cadence until the user
    /// approves, the session expires, or the context ends.
    async fn poll_for_token(
        &self,
        config: &Config,
        device_code: &str,
        interval: u64,
        expires_in: u64,
        cancel: &CancellationToken,
        deadline: tokio::time::Instant,
    ) -> Result<String, AppError> {
        let interval = interval.max(1);
        let max_iterations = expires_in / interval + 1;

        for _ in 0..max_iterations {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                () = cancel.cancelled() => return Err(AppError::Canceled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(AppError::Auth("authentication timed out".to_string()));
                }
            }

            match device::poll_token_once(&self.http, &self.flow, &config.headers, device_code)
                .await?
            {
                device::PollOutcome::Complete(token) => return Ok(token),
                device::PollOutcome::Pending => continue,
            }
        }

        Err(AppError::Auth("authentication timed out".to_string()))
    }

    /// Single poll attempt for browser-driven callers. Pending surfaces as
    /// [`AppError::AuthPending`] so the HTTP layer can answer 202.
    async fn check_token_once(
        &self,
        config: &Config,
        device_code: &str,
    ) -> Result<String, AppError> {
        match device::poll_token_once(&self.http, &self.flow, &config.headers, device_code)
            .await?
        {
            device::PollOutcome::Complete(token) => Ok(token),
            device::PollOutcome::Pending => Err(AppError::AuthPending),
        }
    }

    // -- refresh ---------------------------------------------------------

    /// Return a credential valid for at least the refresh buffer,
    /// refreshing and persisting first when needed.
    ///
    /// With a non-empty `email` the record is loaded from the store; the
    /// store never overrides runtime configuration -- the caller keeps its
    /// own `Config` for headers, CORS, and timeouts. With an empty email
    /// the process-level record (seeded from config) is used.
    pub async fn ensure_valid_token(
        &self,
        email: &str,
        base: &Config,
        cancel: &CancellationToken,
    ) -> Result<CredentialRecord, AppError> {
        let mut record = if email.is_empty() {
            let seeded = self.seed.read().expect("seed lock poisoned").clone();
            seeded.unwrap_or_else(|| CredentialRecord::from_config(base))
        } else {
            self.store.fetch(email).await?
        };

        if record.copilot_token.is_empty() {
            return Err(AppError::Auth(
                "no token available - authentication required".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        if needs_refresh(record.expires_at, now) {
            self.refresh_record(email, &mut record, base, cancel).await?;
        }

        Ok(record)
    }

    /// Refresh the API token using the OAuth token on file, with up to
    /// three attempts and quadratic backoff. Success persists the record
    /// (store for email-keyed records, the seed cache otherwise).
    pub async fn refresh_record(
        &self,
        email: &str,
        record: &mut CredentialRecord,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if let Some(refresh) = &self.refresh_override {
            return refresh(record);
        }

        if record.github_token.is_empty() {
            warn!("Cannot refresh token: no GitHub token available");
            return Err(AppError::Auth(
                "no GitHub token available for refresh".to_string(),
            ));
        }

        let mut attempt = 1u32;
        loop {
            info!(attempt, max_attempts = MAX_REFRESH_ATTEMPTS, "Refreshing Copilot token");
            match device::exchange_api_token(
                &self.http,
                &self.flow,
                &config.headers,
                &record.github_token,
            )
            .await
            {
                Ok(api) => {
                    record.copilot_token = api.token;
                    record.expires_at = api.expires_at;
                    record.refresh_in = api.refresh_in;

                    if email.is_empty() {
                        *self.seed.write().expect("seed lock poisoned") = Some(record.clone());
                    } else {
                        self.store.update(email, record).await?;
                    }

                    let now = chrono::Utc::now().timestamp();
                    info!(expires_in = record.expires_at - now, "Token refresh successful");
                    return Ok(());
                }
                Err(err) => {
                    if attempt >= MAX_REFRESH_ATTEMPTS {
                        return Err(err);
                    }
                    let wait =
                        Duration::from_secs(BASE_REFRESH_DELAY_SECS * u64::from(attempt * attempt));
                    warn!(attempt, wait_secs = wait.as_secs(), error = %err, "Token refresh failed, retrying");

                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        () = cancel.cancelled() => return Err(AppError::Canceled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
