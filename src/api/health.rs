use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cluster_name: String,
    /// API server version, absent when the cluster is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    pub last_cache_refresh: Option<DateTime<Utc>>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let kubernetes_version = match state.api.server_version().await {
        Ok(version) => Some(version),
        Err(e) => {
            tracing::warn!(error = %e, "Kubernetes API server unreachable");
            None
        }
    };
    let status = if kubernetes_version.is_some() {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cluster_name: state.config.cluster_name.clone(),
        kubernetes_version,
        last_cache_refresh: state.cache.last_refresh().await,
    })
}
