//! JWT verification
//!
//! Tokens are HS256, signed with the secret shared with the identity provider.

use crate::auth::Role;
use crate::error::AppError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (operator id or name)
    pub sub: String,
    /// Operator role
    #[serde(default)]
    pub role: Role,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
}

/// Decode and validate a JWT token
pub fn decode_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
            AppError::Unauthorized("Token expired".to_string())
        }
        jsonwebtoken::errors::ErrorKind::InvalidToken => {
            AppError::Unauthorized("Invalid token".to_string())
        }
        _ => AppError::Unauthorized(format!("Token validation failed: {}", e)),
    })?;

    Ok(token_data.claims)
}

/// Mint a token the way the identity provider does
#[cfg(test)]
pub fn issue_token(sub: &str, role: Role, secret: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: sub.to_string(),
        role,
        exp: now + ttl_secs,
        iat: now,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).expect("token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_token_round_trips_role() {
        let token = issue_token("ops-1", Role::Operator, "secret", 60);
        let claims = decode_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, "ops-1");
        assert_eq!(claims.role, Role::Operator);
    }

    #[test]
    fn test_wrong_secret_and_expired_are_unauthorized() {
        let token = issue_token("ops-1", Role::Admin, "secret", 60);
        assert!(matches!(decode_token(&token, "other"), Err(AppError::Unauthorized(_))));

        let expired = issue_token("ops-1", Role::Admin, "secret", -3600);
        assert!(matches!(
            decode_token(&expired, "secret"),
            Err(AppError::Unauthorized(msg)) if msg == "Token expired"
        ));
    }
}
