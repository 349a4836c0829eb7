//! Bearer-token authentication middleware and the `CurrentUser` extractor.

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use super::{AuthError, Claims};

fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }
    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() || parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }
    Ok(token)
}

/// HS256 shared-secret token validation, shared by the HTTP middleware and
/// the WebSocket handshake.
#[derive(Clone)]
pub struct AuthState {
    decoding_key: DecodingKey,
}

impl AuthState {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| {
            tracing::warn!(error = %e, "jwt validation failed");
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(data.claims)
    }
}

/// Authenticated user, injected into request extensions by `auth_middleware`.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingAuthHeader)?;

    let token = bearer_token_from_header(header)?;
    let claims = auth.validate_token(token)?;

    req.extensions_mut().insert(CurrentUser { user_id: claims.sub });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(sub: &str, secret: &str, exp_offset: i64) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: Some(chrono::Utc::now().timestamp()),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn validates_well_formed_token() {
        let auth = AuthState::new("secret");
        let token = token_for("u1", "secret", 3600);
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "u1");
    }

    #[test]
    fn rejects_expired_token() {
        let auth = AuthState::new("secret");
        let token = token_for("u1", "secret", -10);
        let err = auth.validate_token(&token).unwrap_err();
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[test]
    fn rejects_wrong_secret() {
        let auth = AuthState::new("secret");
        let token = token_for("u1", "other-secret", 3600);
        assert!(auth.validate_token(&token).is_err());
    }

    #[test]
    fn bearer_parsing_rejects_malformed_header() {
        assert!(bearer_token_from_header("Token abc").is_err());
        assert!(bearer_token_from_header("Bearer").is_err());
        assert!(bearer_token_from_header("Bearer abc extra").is_err());
        assert!(bearer_token_from_header("Bearer abc").is_ok());
    }
}
