use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid token: {0}")]
    Invalid(#[source] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// User id.
    id: i64,
    iat: i64,
    exp: i64,
}

/// HS256 access tokens carrying a user id.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn issue_token(&self, subject: i64) -> Result<String, TokenError> {
        let iat = chrono::Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = Claims {
            id: subject,
            iat,
            exp: iat.saturating_add(ttl),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(TokenError::Sign)
    }

    /// Returns the user id the token was issued for.
    pub fn verify_token(&self, token: &str) -> Result<i64, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims.id)
            .map_err(TokenError::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new(b"test-secret", Duration::from_secs(3600))
    }

    #[test]
    fn issued_token_verifies_to_subject() {
        let tokens = service();
        let token = tokens.issue_token(42).unwrap();
        assert_eq!(tokens.verify_token(&token).unwrap(), 42);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = service().issue_token(7).unwrap();
        let other = TokenService::new(b"other-secret", Duration::from_secs(3600));
        assert!(matches!(other.verify_token(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(service().verify_token("not.a.token").is_err());
        assert!(service().verify_token("").is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = service();
        let claims = Claims {
            id: 1,
            iat: 1_000,
            exp: 2_000,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &tokens.encoding).unwrap();
        assert!(tokens.verify_token(&token).is_err());
    }
}
