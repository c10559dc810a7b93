//! JWT issuing and validation (HS256)

use argon2::password_hash::rand_core::{OsRng, RngCore};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::middleware::AuthError;

/// Claims carried by every access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Numeric user id
    pub sub: i64,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
    /// Unique per token, so two tokens issued in the same second never collide
    pub jti: String,
}

impl Claims {
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.exp).unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

/// A freshly issued token
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

fn new_token_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    expiry: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        // `sub` is numeric; jsonwebtoken only sees string subjects as present
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            expiry: Duration::hours(expiry_hours),
        }
    }

    pub fn generate_token(&self, user_id: i64, email: &str) -> Result<IssuedToken, AuthError> {
        self.generate_token_at(user_id, email, OffsetDateTime::now_utc())
    }

    /// Issue a token as if it were `issued_at`
    pub fn generate_token_at(
        &self,
        user_id: i64,
        email: &str,
        issued_at: OffsetDateTime,
    ) -> Result<IssuedToken, AuthError> {
        let expires_at = issued_at + self.expiry;
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat: issued_at.unix_timestamp(),
            exp: expires_at.unix_timestamp(),
            jti: new_token_id(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign token: {e}")))?;

        Ok(IssuedToken { token, expires_at })
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                match e.kind() {
                    ErrorKind::ExpiredSignature => tracing::debug!("Token expired"),
                    ErrorKind::InvalidSignature => tracing::warn!("Token signature mismatch"),
                    other => tracing::debug!(error = ?other, "Token rejected"),
                }
                AuthError::InvalidToken
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[test]
    fn test_round_trip_claims() {
        let manager = JwtManager::new(SECRET, 24);
        let issued = manager.generate_token(42, "ada@example.com").unwrap();

        let claims = manager.validate_token(&issued.token).unwrap();
        assert_eq!(claims.sub, 42);
        assert_eq!(claims.email, "ada@example.com");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
        assert_eq!(claims.expires_at().unix_timestamp(), issued.expires_at.unix_timestamp());
        assert_eq!(claims.jti.len(), 32);
    }

    #[test]
    fn test_same_second_tokens_differ() {
        let manager = JwtManager::new(SECRET, 24);
        let now = OffsetDateTime::now_utc();
        let a = manager.generate_token_at(42, "ada@example.com", now).unwrap();
        let b = manager.generate_token_at(42, "ada@example.com", now).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(SECRET, 1);
        let issued = manager
            .generate_token_at(42, "ada@example.com", OffsetDateTime::now_utc() - Duration::hours(2))
            .unwrap();
        assert!(matches!(
            manager.validate_token(&issued.token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issued = JwtManager::new(SECRET, 24)
            .generate_token(42, "ada@example.com")
            .unwrap();
        let other = JwtManager::new("a-different-secret", 24);
        assert!(other.validate_token(&issued.token).is_err());
    }

    #[test]
    fn test_fresh_token_passes_validation() {
        let manager = JwtManager::new(SECRET, 24);
        let issued = manager.generate_token(7, "grace@example.com").unwrap();
        assert_eq!(manager.validate_token(&issued.token).unwrap().sub, 7);
    }

    #[test]
    fn test_token_without_expiry_rejected() {
        #[derive(Serialize)]
        struct NoExpiry {
            sub: i64,
            email: String,
        }

        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoExpiry {
                sub: 42,
                email: "ada@example.com".into(),
            },
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            JwtManager::new(SECRET, 24).validate_token(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let manager = JwtManager::new(SECRET, 24);
        assert!(manager.validate_token("not.a.jwt").is_err());
        assert!(manager.validate_token("").is_err());
    }
}
