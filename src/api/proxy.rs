use std::sync::Arc;

use axum::extract::{Request, State};
use axum::response::Response;

use crate::AppState;

/// ANY /v1/chat/completions, ANY /v1/completions
///
/// Thin HTTP glue: the proxy engine owns admission, dispatch, and the
/// method check (non-POST answers 405 from the worker).
pub async fn proxy_completions(State(state): State<AppState>, request: Request) -> Response {
    Arc::clone(&state.proxy).handle(request).await
}
