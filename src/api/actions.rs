//! Action lifecycle API endpoints
//!
//! Prepare, start, poll and stop disruptions

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;
use uuid::Uuid;

use crate::api::response::{ApiResponse, ResponseMeta};
use crate::api::AppState;
use crate::chaos::{ActionKind, ActionStatus, PrepareRequest};
use crate::error::{AppError, AppResult};

/// Validate a target and capture its original state
pub async fn prepare(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Json(req): Json<PrepareRequest>,
) -> AppResult<ApiResponse<ActionStatus>> {
    let kind: ActionKind = kind
        .parse()
        .map_err(|_| AppError::not_found(&format!("Unknown action {}", kind)))?;
    info!(kind = %kind, "Preparing action");

    let status = state.engine.prepare(kind, req).await?;
    Ok(ApiResponse::success(status))
}

pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<ApiResponse<ActionStatus>> {
    let status = state.engine.start(id).await?;
    Ok(ApiResponse::success(status))
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<ApiResponse<ActionStatus>> {
    let status = state.engine.status(id).await?;
    Ok(ApiResponse::success(status))
}

/// Stop and revert. Safe to call more than once.
pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<ApiResponse<ActionStatus>> {
    let status = state.engine.stop(id).await?;
    Ok(ApiResponse::success(status))
}

pub async fn list(State(state): State<AppState>) -> ApiResponse<Vec<ActionStatus>> {
    let actions = state.engine.list().await;
    let total = actions.len();
    ApiResponse::success_with_meta(actions, ResponseMeta::total(total))
}
