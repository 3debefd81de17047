//! Device-WebSocket JWT authentication
//!
//! Validates the bearer token a connecting device presents during
//! HANDSHAKE→AUTH (§4.8), with a device-whitelist fallback. There is no
//! HTTP login surface here: tokens are provisioned out of band and
//! carried by the device; the gateway only ever verifies them.

use anyhow::{Result, Context, bail};
use thiserror::Error;

use chrono::{DateTime, Utc, Duration};
use jsonwebtoken::{encode, decode, Header, Algorithm, Validation, DecodingKey, EncodingKey};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// AUTH step failures (§4.8 HANDSHAKE→AUTH, Open Question #1).
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no bearer token and device is not whitelisted")]
    MissingToken,
    #[error("bearer token rejected: {0}")]
    InvalidToken(String),
}

/// Decides whether a connecting device may proceed to INIT: the
/// device-whitelist fallback is checked first (cheap, no crypto), then a
/// bearer token is validated against the JWT session store.
pub fn authenticate_device(
    auth_config: &crate::config::AuthConfig,
    jwt: &AuthState,
    device_id: &str,
    bearer_token: Option<&str>,
) -> Result<(), AuthError> {
    if !auth_config.require_auth {
        return Ok(());
    }
    if auth_config.device_whitelist.iter().any(|d| d == device_id) {
        return Ok(());
    }
    let token = bearer_token.ok_or(AuthError::MissingToken)?;
    let claims = jwt.validate_token(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    if claims.token_type != TokenType::Access {
        return Err(AuthError::InvalidToken("not an access token".to_string()));
    }
    Ok(())
}

/// JWT claims structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Issued at
    pub iat: i64,
    /// Expiration time
    pub exp: i64,
    /// Token type (access or refresh)
    pub token_type: TokenType,
    /// User permissions/roles
    pub permissions: Vec<String>,
    /// Session ID for revocation
    pub jti: String,
}

/// Token type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT secret key (should be 256-bit for HS256)
    pub jwt_secret: String,
    /// Access token expiration (minutes)
    pub access_token_expiry_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_jwt_secret(),
            access_token_expiry_minutes: 60,
        }
    }
}

/// Authentication state
pub struct AuthState {
    config: AuthConfig,
    /// Revoked token IDs
    revoked_tokens: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Active sessions
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

/// Session information
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl AuthState {
    /// Create new auth state with config
    pub fn new(config: AuthConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            revoked_tokens: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Generate access token for a device/user id. Used by operator
    /// tooling to provision device tokens out of band; the gateway
    /// itself never mints tokens over HTTP.
    pub fn generate_access_token(&self, user_id: &str, permissions: &[String]) -> Result<String> {
        let now = Utc::now();
        let expiry = now + Duration::minutes(self.config.access_token_expiry_minutes);
        let jti = uuid::Uuid::new_v4().to_string();

        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: expiry.timestamp(),
            token_type: TokenType::Access,
            permissions: permissions.to_vec(),
            jti: jti.clone(),
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        ).context("Failed to encode JWT")?;

        let mut sessions = self.sessions.write().unwrap();
        sessions.insert(jti, SessionInfo {
            user_id: user_id.to_string(),
            created_at: now,
            last_active: now,
        });

        Ok(token)
    }

    /// Validate and decode token
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let jti = self.extract_jti(token)?;
        if self.is_token_revoked(&jti) {
            bail!("Token has been revoked");
        }

        let validation = Validation::new(Algorithm::HS256);
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        ).context("Invalid token")?;

        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(session) = sessions.get_mut(&token_data.claims.jti) {
                session.last_active = Utc::now();
            }
        }

        Ok(token_data.claims)
    }

    /// Extract JTI from token without full validation
    fn extract_jti(&self, token: &str) -> Result<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        ).context("Failed to decode token")?;

        Ok(token_data.claims.jti)
    }

    /// Check if token is revoked
    fn is_token_revoked(&self, jti: &str) -> bool {
        let revoked = self.revoked_tokens.read().unwrap();
        revoked.contains_key(jti)
    }
}

/// Generate a secure JWT secret
pub fn generate_jwt_secret() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwt_generation_and_validation() {
        let config = AuthConfig::default();
        let state = AuthState::new(config);

        let token = state.generate_access_token("user123", &["read".to_string(), "write".to_string()]).unwrap();
        let claims = state.validate_token(&token).unwrap();

        assert_eq!(claims.sub, "user123");
        assert_eq!(claims.permissions, vec!["read", "write"]);
        assert_eq!(claims.token_type, TokenType::Access);
    }

    #[test]
    fn whitelisted_device_bypasses_bearer_requirement() {
        let auth_config = crate::config::AuthConfig {
            device_whitelist: vec!["kitchen-speaker".to_string()],
            ..crate::config::AuthConfig::default()
        };
        let jwt = AuthState::new(AuthConfig::default());
        assert!(authenticate_device(&auth_config, &jwt, "kitchen-speaker", None).is_ok());
    }

    #[test]
    fn unlisted_device_without_token_is_rejected() {
        let auth_config = crate::config::AuthConfig::default();
        let jwt = AuthState::new(AuthConfig::default());
        assert!(matches!(
            authenticate_device(&auth_config, &jwt, "unknown-device", None),
            Err(AuthError::MissingToken)
        ));
    }

    #[test]
    fn valid_access_token_authenticates_unlisted_device() {
        let auth_config = crate::config::AuthConfig::default();
        let jwt_config = AuthConfig::default();
        let jwt = AuthState::new(jwt_config);
        let token = jwt.generate_access_token("unknown-device", &[]).unwrap();
        assert!(authenticate_device(&auth_config, &jwt, "unknown-device", Some(&token)).is_ok());
    }
}
