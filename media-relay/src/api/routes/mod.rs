//! API route modules.

pub mod download;
pub mod health;
pub mod info;
pub mod logging;

use axum::Router;
use axum::routing::{get, post};

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/download", post(download::download))
        .route("/api/info", post(info::media_info))
        .route("/api/health", get(health::health_check))
        .route(
            "/api/logging",
            get(logging::get_logging_config).put(logging::update_logging_config),
        )
        .with_state(state)
}
