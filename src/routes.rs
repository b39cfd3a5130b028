//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod backups;
mod clones;
mod environments;
mod health;
mod schema;
mod security;

use crate::auth::auth_middleware;
use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        .nest("/api", api_routes(state.clone()))
        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Every `/api` route requires a bearer token
fn api_routes(state: SharedState) -> Router<SharedState> {
    Router::new()
        // Environments
        .route(
            "/environments",
            post(environments::register_environment).get(environments::list_environments),
        )
        .route("/environments/{id}", get(environments::get_environment))
        .route("/environments/{id}/classification", get(environments::classify_environment))
        .route("/environments/{id}/schema", get(environments::environment_schema))
        // Schema comparison
        .route("/schema/compare", post(schema::compare_schemas))
        .route("/schema/migration", post(schema::generate_migration))
        // Clones
        .route("/clones", post(clones::start_clone).get(clones::list_clones))
        .route("/clones/{id}", get(clones::get_clone))
        .route("/clones/{id}/cancel", post(clones::cancel_clone))
        .route("/clones/{id}/pause", post(clones::pause_clone))
        .route("/clones/{id}/resume", post(clones::resume_clone))
        // Backups
        .route(
            "/environments/{id}/backups",
            post(backups::create_backup).get(backups::list_backups),
        )
        .route("/environments/{id}/checkpoints", post(backups::create_checkpoint))
        .route("/backups/{id}", delete(backups::delete_backup))
        .route("/backups/{id}/validate", post(backups::validate_backup))
        .route("/backups/{id}/restore", post(backups::restore_backup))
        .route("/backups/{id}/rollback", post(backups::rollback_backup))
        .route("/backups/{id}/verify", post(backups::verify_backup))
        // Security
        .route("/security/alerts", get(security::list_alerts))
        .route_layer(middleware::from_fn_with_state(state, auth_middleware))
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(3600));

    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
