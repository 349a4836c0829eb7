//! JWT claims for bearer-token authentication.

use serde::{Deserialize, Serialize};

/// Minimal HS256 claims: just enough to identify the calling user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,

    /// Expiration time (Unix timestamp).
    pub exp: i64,

    #[serde(default)]
    pub iat: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_roundtrip() {
        let claims = Claims {
            sub: "u1".to_string(),
            exp: 9999999999,
            iat: Some(0),
        };
        let json = serde_json::to_string(&claims).unwrap();
        let back: Claims = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sub, "u1");
    }
}
