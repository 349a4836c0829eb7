//! Authentication errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing authorization header")]
    MissingAuthHeader,

    #[error("invalid authorization header format")]
    InvalidAuthHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    TokenExpired,
}

#[derive(Debug, Serialize)]
struct AuthErrorResponse {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let error_code = match &self {
            AuthError::MissingAuthHeader => "missing_auth_header",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::TokenExpired => "token_expired",
        };
        let body = AuthErrorResponse {
            error: self.to_string(),
            error_code,
        };
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(AuthError::MissingAuthHeader.to_string(), "missing authorization header");
        assert_eq!(AuthError::InvalidToken("bad".into()).to_string(), "invalid token: bad");
    }
}
