//! Discovery API endpoints
//!
//! Targets per kind, enrichment rules and on-demand cache refresh

use axum::extract::{Path, State};
use serde::Serialize;
use tracing::info;

use crate::api::response::{ApiResponse, ResponseMeta};
use crate::api::AppState;
use crate::discovery::{EnrichmentRecord, EnrichmentRule, Target, TargetKind};
use crate::error::{AppError, AppResult};

/// Discover every target of one kind from the current snapshot
pub async fn discover(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> AppResult<ApiResponse<Vec<Target>>> {
    let kind: TargetKind = kind
        .parse()
        .map_err(|_| AppError::bad_request(&format!("Unknown target kind {}", kind)))?;

    let snapshot = state.cache.snapshot().await;
    let targets = state.discovery.discover(&snapshot, kind);

    let mut meta = ResponseMeta::total(targets.len());
    meta.snapshot_at = state.cache.last_refresh().await;
    Ok(ApiResponse::success_with_meta(targets, meta))
}

pub async fn enrichment_rules(State(state): State<AppState>) -> ApiResponse<Vec<EnrichmentRule>> {
    ApiResponse::success(state.discovery.enrichment_rules())
}

/// Evaluate one enrichment rule against the current snapshot
pub async fn enrichment(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> AppResult<ApiResponse<Vec<EnrichmentRecord>>> {
    let snapshot = state.cache.snapshot().await;
    let records = state
        .discovery
        .enrich(&snapshot, &rule_id)
        .ok_or_else(|| AppError::not_found(&format!("Enrichment rule {} not found", rule_id)))?;

    let total = records.len();
    Ok(ApiResponse::success_with_meta(records, ResponseMeta::total(total)))
}

#[derive(Debug, Serialize)]
pub struct RefreshFailure {
    pub kind: String,
    pub error: String,
}

/// Re-list every kind now instead of waiting for the refresh loop
pub async fn refresh(State(state): State<AppState>) -> ApiResponse<Vec<RefreshFailure>> {
    let failures: Vec<_> = state
        .cache
        .refresh(state.api.as_ref())
        .await
        .into_iter()
        .map(|(kind, e)| RefreshFailure {
            kind: kind.to_string(),
            error: e.to_string(),
        })
        .collect();
    info!(failed_kinds = failures.len(), "Cache refreshed on demand");
    ApiResponse::success(failures)
}
