//! Central error boundary: every subsystem's typed error lands here before it
//! crosses the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::auth::AuthError;
use crate::git::GitError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("git clone failed: {0}")]
    GitClone(String),

    #[error("git worktree failed: {0}")]
    GitWorktree(String),

    #[error("git diff failed: {0}")]
    GitDiff(String),

    #[error("git commit failed: {0}")]
    GitCommit(String),

    #[error("git push failed: {0}")]
    GitPush(String),

    #[error("agent provider not found: {0}")]
    AgentNotFound(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyExists(_) => StatusCode::CONFLICT,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::GitClone(_)
            | ApiError::GitWorktree(_)
            | ApiError::GitDiff(_)
            | ApiError::GitCommit(_)
            | ApiError::GitPush(_) => StatusCode::BAD_GATEWAY,
            ApiError::AgentNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Session(_) => StatusCode::CONFLICT,
            ApiError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyExists(_) => "already_exists",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Validation(_) => "validation",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::GitClone(_) => "git_clone",
            ApiError::GitWorktree(_) => "git_worktree",
            ApiError::GitDiff(_) => "git_diff",
            ApiError::GitCommit(_) => "git_commit",
            ApiError::GitPush(_) => "git_push",
            ApiError::AgentNotFound(_) => "agent_not_found",
            ApiError::Session(_) => "session",
            ApiError::Notification(_) => "notification",
            ApiError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.error_code(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<GitError> for ApiError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::Clone(msg) => ApiError::GitClone(msg),
            GitError::Worktree(msg) => ApiError::GitWorktree(msg),
            GitError::Diff(msg) => ApiError::GitDiff(msg),
            GitError::Commit(msg) => ApiError::GitCommit(msg),
            GitError::Push(msg) => ApiError::GitPush(msg),
            GitError::Io(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuthHeader | AuthError::InvalidAuthHeader | AuthError::InvalidToken(_) => {
                ApiError::Unauthorized(err.to_string())
            }
            AuthError::TokenExpired => ApiError::Unauthorized(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::RowNotFound) {
            ApiError::NotFound("row not found".to_string())
        } else {
            ApiError::Internal(err.to_string())
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("not found") {
            ApiError::NotFound(msg)
        } else if lower.contains("already exists") || lower.contains("already taken") {
            ApiError::AlreadyExists(msg)
        } else if lower.contains("forbidden") || lower.contains("permission") {
            ApiError::Forbidden(msg)
        } else if lower.contains("unauthorized") || lower.contains("authentication") {
            ApiError::Unauthorized(msg)
        } else if lower.contains("invalid") || lower.contains("must be") {
            ApiError::Validation(msg)
        } else {
            ApiError::Internal(msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_status_codes() {
        assert_eq!(ApiError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::already_exists("x").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::validation("x").status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn categorizes_anyhow_errors() {
        let err: ApiError = anyhow::anyhow!("session not found").into();
        assert!(matches!(err, ApiError::NotFound(_)));

        let err: ApiError = anyhow::anyhow!("identity already exists").into();
        assert!(matches!(err, ApiError::AlreadyExists(_)));
    }
}
