//! HTTP API routes and handlers.
//!
//! This module contains all HTTP endpoint implementations organized by domain:
//! - `health` - Service health checks
//! - `status` - Bubble state, restriction decision and links
//! - `accessories` - Remembered accessories and link commands
//! - `sessions` - Session logs and daily snapshots
//! - `events` - Triggers from the task store, geofence and host lifecycle
//! - `ranging` - Distance input and permission probing
//! - `error` - API error types
//! - `openapi` - OpenAPI specification generation

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::state::SharedState;

pub mod accessories;
pub mod error;
pub mod events;
pub mod health;
pub mod openapi;
pub mod ranging;
pub mod sessions;
pub mod status;

// Re-export commonly used types
pub use error::{ApiError, ApiResult, ErrorResponse};

// Re-export OpenAPI utilities for the gen-openapi binary
pub use openapi::get_openapi_json;

/// Creates the combined API router with all endpoints.
///
/// # Route Structure
///
/// ```text
/// /health                 - Health check
/// /swagger-ui             - Interactive API documentation
/// /api
/// ├── /status             - Engine status
/// ├── /accessories        - List, connect, stop, forget
/// ├── /sessions           - Restriction and bubble-outside logs
/// ├── /snapshots          - Daily task snapshots
/// ├── /events             - External triggers
/// ├── /ranging            - Distance input, permission probe
/// └── /openapi.json       - OpenAPI specification
/// ```
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest(
            "/api",
            Router::new()
                .route("/status", get(status::get_status))
                .route("/snapshots", get(sessions::get_snapshots))
                .route("/openapi.json", get(openapi::get_openapi_spec))
                .nest("/accessories", accessories::router())
                .nest("/sessions", sessions::router())
                .nest("/events", events::router())
                .nest("/ranging", ranging::router()),
        )
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", openapi::ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
