use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{routes, state::AppState};

/// Construct the Axum [`Router`] with all routes and middleware attached.
///
/// Middleware is applied in outer-to-inner order (outermost runs first on
/// request, last on response):
///
/// 1. `TraceLayer`: structured request/response logging via `tracing`.
/// 2. `CorsLayer`: the session endpoint is called from tracked sites.
/// 3. `CompressionLayer`: gzip for report downloads.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health))
        .route("/api/conversions", post(routes::conversions::ingest_conversion))
        .route("/api/sessions", post(routes::sessions::record_session))
        .route(
            "/api/sessions/{id}/similar",
            get(routes::sessions::similar_sessions),
        )
        .route(
            "/api/touchpoints",
            put(routes::touchpoints::replace_touchpoints),
        )
        .route(
            "/api/contacts/duplicates",
            post(routes::contacts::find_duplicates),
        )
        .route(
            "/api/contacts/cleanup",
            post(routes::contacts::cleanup_duplicates),
        )
        .route(
            "/api/contacts/{id}/attribution",
            get(routes::contacts::contact_attribution),
        )
        .route(
            "/api/identities/resolve",
            get(routes::identities::resolve_identity),
        )
        .route(
            "/api/reports/attribution",
            get(routes::reports::attribution_report),
        )
        .layer(CompressionLayer::new())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
