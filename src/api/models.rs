//! Model catalog endpoint.
//!
//! `/v1/models` never hits the Copilot API. The catalog is loaded once from
//! models.dev (falling back to a built-in list), cached for the process
//! lifetime, and identical concurrent cold-cache requests are coalesced
//! into a single load. The configured allow-list filters the listing as a
//! UX aid; admission-time enforcement in the proxy is the authoritative
//! copy.

use std::sync::{Arc, RwLock};

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::proxy::coalesce::{fingerprint, CoalescingCache};
use crate::AppState;

/// Catalog source queried on the first request.
pub const MODELS_DEV_URL: &str = "https://models.dev/api.json";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

/// `/v1/models` response; `note` marks an allow-list-filtered listing.
#[derive(Debug, Serialize)]
pub struct ModelsReply {
    pub object: String,
    pub data: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// models.dev catalog shape: provider id -> models keyed by model id.
#[derive(Debug, Deserialize)]
struct ModelsDevProvider {
    #[serde(default)]
    models: std::collections::HashMap<String, ModelsDevModel>,
}

#[derive(Debug, Deserialize)]
struct ModelsDevModel {
    #[serde(default)]
    name: String,
    #[serde(default)]
    owned_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Models service
// ---------------------------------------------------------------------------

/// Process-wide catalog cache behind a coalescing guard.
pub struct ModelsService {
    http: reqwest::Client,
    catalog_url: String,
    coalescer: CoalescingCache<Arc<ModelList>>,
    catalog: RwLock<Option<Arc<ModelList>>>,
}

impl ModelsService {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_catalog_url(http, MODELS_DEV_URL.to_string())
    }

    /// Use an alternative catalog source (tests).
    pub fn with_catalog_url(http: reqwest::Client, catalog_url: String) -> Self {
        Self {
            http,
            catalog_url,
            coalescer: CoalescingCache::new(),
            catalog: RwLock::new(None),
        }
    }

    /// The full (unfiltered) model list, loading it on first use.
    pub async fn list(&self) -> Arc<ModelList> {
        if let Some(cached) = self.catalog.read().expect("catalog lock poisoned").clone() {
            return cached;
        }

        let key = fingerprint("GET", "/v1/models", None);
        self.coalescer
            .coalesce(&key, || async {
                // Double-check: another coalesced round may have filled the
                // cache between our miss and becoming the producer.
                if let Some(cached) =
                    self.catalog.read().expect("catalog lock poisoned").clone()
                {
                    return cached;
                }

                info!("Loading models for the first time");
                let list = Arc::new(self.load().await);
                *self.catalog.write().expect("catalog lock poisoned") = Some(Arc::clone(&list));
                info!(count = list.data.len(), "Loaded and cached models");
                list
            })
            .await
    }

    /// Drop the cached catalog so the next request reloads it.
    pub fn reset(&self) {
        *self.catalog.write().expect("catalog lock poisoned") = None;
    }

    async fn load(&self) -> ModelList {
        match fetch_models_dev(&self.http, &self.catalog_url).await {
            Ok(list) => list,
            Err(err) => {
                warn!(error = %err, "Failed to fetch model catalog, using defaults");
                ModelList {
                    object: "list".to_string(),
                    data: default_models(),
                }
            }
        }
    }
}

/// Fetch the Copilot model set from the models.dev catalog.
pub async fn fetch_models_dev(
    http: &reqwest::Client,
    url: &str,
) -> Result<ModelList, crate::error::AppError> {
    let response = http.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(crate::error::AppError::Network(format!(
            "model catalog returned HTTP {}",
            status.as_u16()
        )));
    }

    let providers: std::collections::HashMap<String, ModelsDevProvider> =
        response.json().await.map_err(|e| {
            crate::error::AppError::Network(format!("failed to decode model catalog: {e}"))
        })?;

    let copilot = providers.get("github-copilot").ok_or_else(|| {
        crate::error::AppError::Validation(
            "github-copilot provider not found in catalog".to_string(),
        )
    })?;

    let now = Utc::now().timestamp();
    let data = copilot
        .models
        .iter()
        .map(|(id, model)| ModelInfo {
            id: id.clone(),
            object: "model".to_string(),
            created: now,
            owned_by: model
                .owned_by
                .clone()
                .unwrap_or_else(|| infer_owner(&model.name)),
        })
        .collect();

    Ok(ModelList {
        object: "list".to_string(),
        data,
    })
}

/// Guess the owning vendor from a model's display name.
fn infer_owner(name: &str) -> String {
    let name = name.to_lowercase();
    let contains_any = |subs: &[&str]| subs.iter().any(|s| name.contains(s));
    if contains_any(&["claude", "anthropic"]) {
        "anthropic".to_string()
    } else if contains_any(&["gpt", "o1", "o3", "o4", "openai"]) {
        "openai".to_string()
    } else if contains_any(&["gemini", "google"]) {
        "google".to_string()
    } else {
        "github-copilot".to_string()
    }
}

/// Built-in fallback mirroring the models.dev GitHub Copilot entries.
pub fn default_models() -> Vec<ModelInfo> {
    let now = Utc::now().timestamp();
    let model = |id: &str, owned_by: &str| ModelInfo {
        id: id.to_string(),
        object: "model".to_string(),
        created: now,
        owned_by: owned_by.to_string(),
    };
    vec![
        model("gpt-4o", "openai"),
        model("gpt-4.1", "openai"),
        model("o3", "openai"),
        model("o3-mini", "openai"),
        model("o4-mini", "openai"),
        model("claude-3.5-sonnet", "anthropic"),
        model("claude-3.7-sonnet", "anthropic"),
        model("claude-3.7-sonnet-thought", "anthropic"),
        model("claude-opus-4", "anthropic"),
        model("claude-sonnet-4", "anthropic"),
        model("gemini-2.5-pro", "google"),
        model("gemini-2.0-flash-001", "google"),
    ]
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// ANY /v1/models
///
/// Returns the cached catalog, filtered by the configured allow-list.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsReply> {
    let list = state.models.list().await;

    let (data, note) = if state.config.allowed_models.is_empty() {
        (list.data.clone(), None)
    } else {
        let filtered: Vec<ModelInfo> = list
            .data
            .iter()
            .filter(|m| state.config.model_allowed(&m.id))
            .cloned()
            .collect();
        (
            filtered,
            Some("(filtered by allowed_models from config)".to_string()),
        )
    };

    Json(ModelsReply {
        object: "list".to_string(),
        data,
        note,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
