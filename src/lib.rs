pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod middleware;
pub mod net;
pub mod proxy;
pub mod store;

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::api::models::ModelsService;
use crate::auth::AuthService;
use crate::config::Config;
use crate::proxy::pool::WorkerPool;
use crate::proxy::ProxyService;
use crate::store::TokenStore;

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub auth: Arc<AuthService>,
    pub proxy: Arc<ProxyService>,
    pub models: Arc<ModelsService>,
    pub pool: Arc<WorkerPool>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire up the full component graph from a configuration.
    pub fn from_config(config: Config) -> Self {
        let config = Arc::new(config);
        let http = net::build_http_client(&config.timeouts);
        let store = TokenStore::new(http.clone());
        let auth = Arc::new(AuthService::new(http.clone(), store));
        let pool = Arc::new(WorkerPool::new(0));
        let proxy = Arc::new(ProxyService::new(
            Arc::clone(&config),
            http.clone(),
            Arc::clone(&auth),
            Arc::clone(&pool),
        ));
        let models = Arc::new(ModelsService::new(http.clone()));

        Self {
            config,
            http,
            auth,
            proxy,
            models,
            pool,
            started_at: Instant::now(),
        }
    }
}

/// Build the application router with the full middleware stack.
pub fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    api::build_api_router()
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Build the CORS layer from config. A `*` origin means permissive.
fn build_cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.cors.allowed_origins;
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<axum::http::HeaderValue> =
            origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
