//! Test utilities shared across integration test files.

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

pub const TEST_JWT_SECRET: &str = "test-secret-for-integration-tests";

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: i64,
}

/// Mints a bearer token accepted by `AuthState::new(TEST_JWT_SECRET)`.
pub fn bearer_token(user_id: &str) -> String {
    let claims = TestClaims {
        sub: user_id.to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(TEST_JWT_SECRET.as_bytes()))
        .expect("encoding test jwt")
}
