//! Error types for kubefault
//!
//! Three layers:
//! - [`ClusterError`]: a classified Kubernetes API failure
//! - [`ActionError`]: the action engine taxonomy
//! - [`AppError`]: what the HTTP surface renders

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::response::ApiResponse;

/// A Kubernetes API failure, classified so callers can treat "not found"
/// and "conflict" as distinct outcomes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The resource does not exist (HTTP 404)
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Optimistic concurrency failure (HTTP 409)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limiting, server-side unavailability or transport failure
    #[error("transient cluster error: {0}")]
    Transient(String),

    /// Authorization, schema or other permanent failures
    #[error("fatal cluster error: {0}")]
    Fatal(String),
}

impl ClusterError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Classify a kube error; `kind`/`name` describe the addressed object.
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::not_found(kind, name),
                409 => Self::Conflict(resp.message),
                429 | 500 | 502 | 503 | 504 => Self::Transient(format!(
                    "{} ({}): {}",
                    resp.reason, resp.code, resp.message
                )),
                _ => Self::Fatal(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
            },
            kube::Error::HyperError(e) => Self::Transient(e.to_string()),
            kube::Error::Service(e) => Self::Transient(e.to_string()),
            other => Self::Fatal(other.to_string()),
        }
    }
}

/// Errors produced while preparing, running or reverting an action
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// Missing or malformed target attribute or configuration
    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A polled condition was not reached in time
    #[error("convergence timeout: {0}")]
    ConvergenceTimeout(String),

    /// Pods still left on a node after every eviction round
    #[error("drain of node {node} incomplete: {remaining} pods remain")]
    DrainIncomplete { node: String, remaining: usize },

    /// The forward mutation could not be undone
    #[error("revert failed: {0}")]
    RevertFailed(String),

    #[error("unknown action {0}")]
    UnknownAction(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("action store error: {0}")]
    Store(String),
}

impl ActionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Stable code used in status reports
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Cluster(ClusterError::NotFound { .. }) => "NOT_FOUND",
            Self::Cluster(ClusterError::Conflict(_)) | Self::Cluster(ClusterError::Transient(_)) => {
                "TRANSIENT_CLUSTER_ERROR"
            }
            Self::Cluster(ClusterError::Fatal(_)) => "FATAL_API_ERROR",
            Self::ConvergenceTimeout(_) => "CONVERGENCE_TIMEOUT",
            Self::DrainIncomplete { .. } => "DRAIN_INCOMPLETE",
            Self::RevertFailed(_) => "REVERT_FAILED",
            Self::UnknownAction(_) => "UNKNOWN_ACTION",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl From<sqlx::Error> for ActionError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors rendered by the HTTP layer
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Kubernetes(#[from] ClusterError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn not_found(msg: &str) -> Self {
        Self::NotFound(msg.to_string())
    }

    pub fn bad_request(msg: &str) -> Self {
        Self::BadRequest(msg.to_string())
    }

    pub fn internal(msg: &str) -> Self {
        Self::Internal(msg.to_string())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Kubernetes(_) => "KUBERNETES_ERROR",
            Self::Serialization(_) => "JSON_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Kubernetes(ClusterError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Kubernetes(ClusterError::Conflict(_)) => StatusCode::CONFLICT,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ActionError> for AppError {
    fn from(err: ActionError) -> Self {
        match err {
            ActionError::Validation(msg) => Self::BadRequest(msg),
            ActionError::UnknownAction(id) => Self::NotFound(format!("action {} not found", id)),
            ActionError::InvalidTransition(msg) => Self::Conflict(msg),
            ActionError::Cluster(e) => Self::Kubernetes(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ApiResponse::error(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
