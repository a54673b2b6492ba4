use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::AppError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_PORT: u16 = 8081;

const DEFAULT_USER_AGENT: &str = "GitHubCopilotChat/0.29.1";
const DEFAULT_EDITOR_VERSION: &str = "vscode/1.102.3";
const DEFAULT_EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.29.1";
const DEFAULT_COPILOT_INTEGRATION_ID: &str = "vscode-chat";
const DEFAULT_OPENAI_INTENT: &str = "conversation-edits";
const DEFAULT_X_INITIATOR: &str = "user";

// Timeout validation ranges (seconds).
const MIN_TIMEOUT: u64 = 1;
const MAX_SHORT_TIMEOUT: u64 = 300;
const MAX_LONG_TIMEOUT: u64 = 3600;

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

/// Application configuration. Read-only once the server is running.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Email identifying the credential record in the external store.
    /// When empty the service runs on a process-level credential seeded
    /// from `GITHUB_TOKEN` / `COPILOT_TOKEN`.
    #[serde(default)]
    pub user_email: String,

    /// GitHub OAuth token (seeds refresh; overridable via `GITHUB_TOKEN`).
    #[serde(default)]
    pub github_token: String,

    /// Copilot API bearer token (overridable via `COPILOT_TOKEN`).
    #[serde(default)]
    pub copilot_token: String,

    /// Absolute expiry of `copilot_token`, seconds since epoch.
    #[serde(default)]
    pub expires_at: i64,

    /// Advisory refresh interval reported by the token exchange, seconds.
    #[serde(default)]
    pub refresh_in: i64,

    /// Model allow-list. Empty permits all models.
    #[serde(default)]
    pub allowed_models: Vec<String>,

    #[serde(default)]
    pub headers: HeaderTemplate,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub timeouts: Timeouts,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Header template injected into every upstream request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderTemplate {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_editor_version")]
    pub editor_version: String,
    #[serde(default = "default_editor_plugin_version")]
    pub editor_plugin_version: String,
    #[serde(default = "default_copilot_integration_id")]
    pub copilot_integration_id: String,
    #[serde(default = "default_openai_intent")]
    pub openai_intent: String,
    #[serde(default = "default_x_initiator")]
    pub x_initiator: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_cors_any")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_cors_any")]
    pub allowed_headers: Vec<String>,
}

/// Timeout knobs, all in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Timeouts {
    /// Whole-request timeout on the upstream HTTP client.
    #[serde(default = "default_http_client")]
    pub http_client: u64,
    #[serde(default = "default_server_read")]
    pub server_read: u64,
    #[serde(default = "default_server_write")]
    pub server_write: u64,
    #[serde(default = "default_server_idle")]
    pub server_idle: u64,
    /// Deadline for a single proxied request, including streaming hand-off.
    #[serde(default = "default_proxy_context")]
    pub proxy_context: u64,
    /// How long the circuit breaker stays open before a half-open probe.
    #[serde(default = "default_circuit_breaker")]
    pub circuit_breaker: u64,
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_tls_handshake")]
    pub tls_handshake: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}
fn default_editor_version() -> String {
    DEFAULT_EDITOR_VERSION.to_string()
}
fn default_editor_plugin_version() -> String {
    DEFAULT_EDITOR_PLUGIN_VERSION.to_string()
}
fn default_copilot_integration_id() -> String {
    DEFAULT_COPILOT_INTEGRATION_ID.to_string()
}
fn default_openai_intent() -> String {
    DEFAULT_OPENAI_INTENT.to_string()
}
fn default_x_initiator() -> String {
    DEFAULT_X_INITIATOR.to_string()
}
fn default_cors_any() -> Vec<String> {
    vec!["*".to_string()]
}
const fn default_http_client() -> u64 {
    300
}
const fn default_server_read() -> u64 {
    30
}
const fn default_server_write() -> u64 {
    300
}
const fn default_server_idle() -> u64 {
    120
}
const fn default_proxy_context() -> u64 {
    300
}
const fn default_circuit_breaker() -> u64 {
    30
}
const fn default_keep_alive() -> u64 {
    30
}
const fn default_tls_handshake() -> u64 {
    10
}
const fn default_dial_timeout() -> u64 {
    10
}
const fn default_idle_conn_timeout() -> u64 {
    90
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HeaderTemplate {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            editor_version: default_editor_version(),
            editor_plugin_version: default_editor_plugin_version(),
            copilot_integration_id: default_copilot_integration_id(),
            openai_intent: default_openai_intent(),
            x_initiator: default_x_initiator(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_any(),
            allowed_headers: default_cors_any(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            http_client: default_http_client(),
            server_read: default_server_read(),
            server_write: default_server_write(),
            server_idle: default_server_idle(),
            proxy_context: default_proxy_context(),
            circuit_breaker: default_circuit_breaker(),
            keep_alive: default_keep_alive(),
            tls_handshake: default_tls_handshake(),
            dial_timeout: default_dial_timeout(),
            idle_conn_timeout: default_idle_conn_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            user_email: String::new(),
            github_token: String::new(),
            copilot_token: String::new(),
            expires_at: 0,
            refresh_in: 0,
            allowed_models: Vec::new(),
            headers: HeaderTemplate::default(),
            cors: CorsConfig::default(),
            timeouts: Timeouts::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading, env overrides, and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from an optional TOML file, apply environment
    /// overrides, and validate.
    ///
    /// With `skip_token_validation`, the token-presence check is waived
    /// (for paths that serve without credentials, e.g. the models listing).
    pub fn load(path: Option<&Path>, skip_token_validation: bool) -> Result<Self, AppError> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| AppError::Internal(format!("failed to read config: {e}")))?;
                toml::from_str(&content)
                    .map_err(|e| AppError::Validation(format!("invalid config file: {e}")))?
            }
            Some(p) => {
                tracing::warn!(path = %p.display(), "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides();

        if skip_token_validation {
            config.validate_core()?;
        } else {
            config.validate()?;
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Whether the allow-list admits `model`. An empty list permits all.
    pub fn model_allowed(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }

    /// Apply environment variable overrides. Env vars always win over the
    /// config file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("COPILOT_PORT") {
            if let Ok(p) = port.parse() {
                self.port = p;
            }
        }
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            if !token.is_empty() {
                self.github_token = token;
            }
        }
        if let Ok(token) = std::env::var("COPILOT_TOKEN") {
            if !token.is_empty() {
                self.copilot_token = token;
            }
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Full validation, including the token-presence requirement.
    pub fn validate(&self) -> Result<(), AppError> {
        self.validate_core()?;
        if self.github_token.is_empty() && self.copilot_token.is_empty() && self.user_email.is_empty() {
            return Err(AppError::Validation(
                "missing github_token or copilot_token".to_string(),
            ));
        }
        Ok(())
    }

    /// Structural validation: port, timeout ranges, headers, CORS.
    pub fn validate_core(&self) -> Result<(), AppError> {
        if self.port == 0 {
            return Err(AppError::Validation(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        self.validate_timeouts()?;
        self.validate_headers()?;
        self.validate_cors()?;
        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), AppError> {
        let t = &self.timeouts;
        let short = [
            ("server_read", t.server_read),
            ("circuit_breaker", t.circuit_breaker),
            ("keep_alive", t.keep_alive),
            ("tls_handshake", t.tls_handshake),
            ("dial_timeout", t.dial_timeout),
        ];
        let long = [
            ("http_client", t.http_client),
            ("server_write", t.server_write),
            ("server_idle", t.server_idle),
            ("proxy_context", t.proxy_context),
            ("idle_conn_timeout", t.idle_conn_timeout),
        ];
        for (name, value) in short {
            if !(MIN_TIMEOUT..=MAX_SHORT_TIMEOUT).contains(&value) {
                return Err(AppError::Validation(format!(
                    "timeouts.{name} must be between {MIN_TIMEOUT} and {MAX_SHORT_TIMEOUT} seconds"
                )));
            }
        }
        for (name, value) in long {
            if !(MIN_TIMEOUT..=MAX_LONG_TIMEOUT).contains(&value) {
                return Err(AppError::Validation(format!(
                    "timeouts.{name} must be between {MIN_TIMEOUT} and {MAX_LONG_TIMEOUT} seconds"
                )));
            }
        }
        Ok(())
    }

    fn validate_headers(&self) -> Result<(), AppError> {
        let h = &self.headers;
        let fields = [
            ("user_agent", &h.user_agent),
            ("editor_version", &h.editor_version),
            ("editor_plugin_version", &h.editor_plugin_version),
            ("copilot_integration_id", &h.copilot_integration_id),
            ("openai_intent", &h.openai_intent),
            ("x_initiator", &h.x_initiator),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(AppError::Validation(format!(
                    "headers.{name} cannot be empty"
                )));
            }
        }
        Ok(())
    }

    fn validate_cors(&self) -> Result<(), AppError> {
        if self.cors.allowed_origins.is_empty() {
            return Err(AppError::Validation(
                "cors.allowed_origins cannot be empty".to_string(),
            ));
        }
        if self.cors.allowed_headers.is_empty() {
            return Err(AppError::Validation(
                "cors.allowed_headers cannot be empty".to_string(),
            ));
        }
        for origin in &self.cors.allowed_origins {
            if origin != "*"
                && !origin.starts_with("http://")
                && !origin.starts_with("https://")
                && !origin.starts_with("localhost")
                && !origin.starts_with("127.0.0.1")
            {
                tracing::warn!(origin = %origin, "CORS origin may not be a valid URL");
            }
        }
        Ok(())
    }
}

/// Validate an email of the shape `local@domain.tld`.
///
/// Local part: alphanumerics plus `._%+-`. Domain: alphanumeric labels with
/// dots and dashes, ending in an alphabetic TLD of at least two characters.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }
    let Some((_, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let labels_ok = domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    labels_ok
        && !domain.starts_with('.')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
