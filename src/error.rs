//! Taxonomy of errors the core can surface, and how they map onto HTTP.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// The error type returned by every fallible core operation and turned
/// directly into an HTTP response at the router boundary.
#[derive(Debug, Error)]
pub enum SupervisorError {
    // --- Validation ---
    #[error("invalid app name {0:?}")]
    InvalidName(String),
    #[error("unsafe archive entry path: {0}")]
    UnsafeArchivePath(String),
    #[error("could not classify project: no manifest and no index.html found")]
    UnclassifiableProject,
    #[error("app {0:?} has no webhook secret configured")]
    WebhookNotConfigured(String),
    #[error("webhook signature verification failed")]
    InvalidWebhookSignature,

    // --- State ---
    #[error("app {0:?} already exists")]
    AppAlreadyExists(String),
    #[error("app {0:?} is not registered")]
    AppMissing(String),
    #[error("app {0:?} is already running")]
    AlreadyRunning(String),
    #[error("app {0:?} is not running")]
    NotRunning(String),
    #[error("app {app:?} has no version {version:?}")]
    VersionMissing { app: String, version: String },
    #[error("app {0:?} is already at the requested version")]
    AlreadyAtVersion(String),
    #[error("working directory for app {0:?} is gone")]
    WorkingDirGone(String),

    // --- Resource ---
    #[error("no free port found at or above the configured floor")]
    NoFreePort,
    #[error("dependency install failed for app {0:?}")]
    InstallFailed(String),
    #[error("git clone failed for app {0:?}")]
    CloneFailed(String),
    #[error("archive extraction failed: {0}")]
    ExtractionFailed(String),

    // --- System (never swallowed) ---
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// Short, stable identifier for the error kind (used as the JSON `error` field).
    fn kind(&self) -> &'static str {
        match self {
            SupervisorError::InvalidName(_) => "InvalidName",
            SupervisorError::UnsafeArchivePath(_) => "UnsafeArchivePath",
            SupervisorError::UnclassifiableProject => "UnclassifiableProject",
            SupervisorError::WebhookNotConfigured(_) => "WebhookNotConfigured",
            SupervisorError::InvalidWebhookSignature => "InvalidWebhookSignature",
            SupervisorError::AppAlreadyExists(_) => "AppAlreadyExists",
            SupervisorError::AppMissing(_) => "AppMissing",
            SupervisorError::AlreadyRunning(_) => "AlreadyRunning",
            SupervisorError::NotRunning(_) => "NotRunning",
            SupervisorError::VersionMissing { .. } => "VersionMissing",
            SupervisorError::AlreadyAtVersion(_) => "AlreadyAtVersion",
            SupervisorError::WorkingDirGone(_) => "WorkingDirGone",
            SupervisorError::NoFreePort => "NoFreePort",
            SupervisorError::InstallFailed(_) => "InstallFailed",
            SupervisorError::CloneFailed(_) => "CloneFailed",
            SupervisorError::ExtractionFailed(_) => "ExtractionFailed",
            SupervisorError::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        use SupervisorError::*;
        match self {
            InvalidName(_)
            | UnsafeArchivePath(_)
            | UnclassifiableProject
            | WebhookNotConfigured(_) => StatusCode::BAD_REQUEST,
            InvalidWebhookSignature => StatusCode::UNAUTHORIZED,
            AppAlreadyExists(_) | AlreadyRunning(_) | AlreadyAtVersion(_) => StatusCode::CONFLICT,
            AppMissing(_) | VersionMissing { .. } => StatusCode::NOT_FOUND,
            NotRunning(_) | WorkingDirGone(_) => StatusCode::CONFLICT,
            NoFreePort | InstallFailed(_) | CloneFailed(_) | ExtractionFailed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if matches!(self, SupervisorError::Internal(_)) {
            tracing::error!(err = %self, "internal error");
        }
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
