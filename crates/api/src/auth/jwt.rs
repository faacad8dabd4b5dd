//! JWT validation
//!
//! The identity provider issues HS256 bearer tokens; this server only
//! verifies them. A bad or missing token is rejected before any entitlement
//! is computed or state is touched.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    pub email: String,
    /// Expiry, seconds since epoch.
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    /// Verify a bearer token and extract the authenticated identity.
    pub fn verify(&self, token: &str) -> Result<AuthUser, ApiError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "JWT validation failed");
            ApiError::Unauthorized
        })?;

        let id = Uuid::parse_str(&data.claims.sub).map_err(|_| ApiError::Unauthorized)?;

        Ok(AuthUser {
            id,
            email: data.claims.email,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-jwt-secret";

    fn token_for(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> usize {
        (time::OffsetDateTime::now_utc().unix_timestamp() + 3600) as usize
    }

    #[test]
    fn valid_token_yields_auth_user() {
        let manager = JwtManager::new(SECRET);
        let user_id = Uuid::new_v4();
        let token = token_for(
            &Claims {
                sub: user_id.to_string(),
                email: "user@echodeck.app".to_string(),
                exp: future_exp(),
            },
            SECRET,
        );

        let user = manager.verify(&token).unwrap();
        assert_eq!(user.id, user_id);
        assert_eq!(user.email, "user@echodeck.app");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let manager = JwtManager::new(SECRET);
        let token = token_for(
            &Claims {
                sub: Uuid::new_v4().to_string(),
                email: "user@echodeck.app".to_string(),
                exp: future_exp(),
            },
            "another-secret",
        );

        assert!(matches!(
            manager.verify(&token),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let manager = JwtManager::new(SECRET);
        let token = token_for(
            &Claims {
                sub: Uuid::new_v4().to_string(),
                email: "user@echodeck.app".to_string(),
                exp: 1_000_000,
            },
            SECRET,
        );

        assert!(matches!(
            manager.verify(&token),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let manager = JwtManager::new(SECRET);
        let token = token_for(
            &Claims {
                sub: "not-a-uuid".to_string(),
                email: "user@echodeck.app".to_string(),
                exp: future_exp(),
            },
            SECRET,
        );

        assert!(matches!(
            manager.verify(&token),
            Err(ApiError::Unauthorized)
        ));
    }
}
