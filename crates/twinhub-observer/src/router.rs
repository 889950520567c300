//! Axum router construction for the status API.

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the status API router.
///
/// The API is read-only, so CORS allows any origin for `GET`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET]);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/streams", get(handlers::list_streams))
        .route("/api/streams/{stream_id}", get(handlers::get_stream))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
