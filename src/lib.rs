//! kubefault library
//!
//! Cluster snapshot cache, target discovery and revertible fault injection
//! for Kubernetes, plus the HTTP surface exposing them.

pub mod api;
pub mod chaos;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod k8s;
pub mod retry;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Discovery
        .route(
            "/discovery/enrichment-rules",
            get(api::discovery::enrichment_rules),
        )
        .route(
            "/discovery/enrichment/:rule_id",
            get(api::discovery::enrichment),
        )
        .route("/discovery/refresh", post(api::discovery::refresh))
        .route("/discovery/:kind", get(api::discovery::discover))
        // Actions
        .route("/actions", get(api::actions::list))
        .route("/actions/prepare/:kind", post(api::actions::prepare))
        .route("/actions/:id/start", post(api::actions::start))
        .route("/actions/:id/status", get(api::actions::status))
        .route("/actions/:id/stop", post(api::actions::stop))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
