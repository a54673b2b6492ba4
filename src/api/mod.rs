pub mod auth_api;
pub mod health;
pub mod models;
pub mod proxy;

use axum::routing::{any, get, post};
use axum::Router;

use crate::AppState;

/// Build the API router.
///
/// Route layout:
/// ```text
/// /health                   GET   liveness
/// /v1/models                ANY   coalesced catalog listing
/// /v1/chat/completions      ANY   proxied (worker enforces POST)
/// /v1/completions           ANY   proxied (worker enforces POST)
/// /v1/auth/github           POST  combined device flow
/// /v1/auth/github/stage1    POST  device code issuance
/// /v1/auth/github/stage2    POST  token completion (202 while pending)
/// ```
pub fn build_api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/v1/models", any(models::list_models))
        .route("/v1/chat/completions", any(proxy::proxy_completions))
        .route("/v1/completions", any(proxy::proxy_completions))
        .route("/v1/auth/github", post(auth_api::authenticate))
        .route("/v1/auth/github/stage1", post(auth_api::stage1))
        .route("/v1/auth/github/stage2", post(auth_api::stage2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_api_router_creates_router() {
        // Smoke test: ensure the router builds without panicking.
        let _router: Router<AppState> = build_api_router();
    }
}
