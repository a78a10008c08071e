use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind as JwtErrorKind, Algorithm, DecodingKey, EncodingKey,
    Header, Validation,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::Session;
use crate::services::error::SessionError;

/// JWT service for session token generation and validation
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_expiry_minutes: i64,
    session_expiry_hours: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenUse {
    Access,
    Refresh,
}

impl TokenUse {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        }
    }
}

/// Claims carried by both access and refresh tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Session ID
    pub sid: Uuid,
    /// Subject (user ID)
    pub sub: Uuid,
    /// Device ID
    pub did: Uuid,
    /// Refresh counter snapshot at issue time
    pub rc: i64,
    pub token_use: TokenUse,
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let secret = config.secret.expose_secret();
        if secret.is_empty() {
            return Err(anyhow::anyhow!("JWT secret must not be empty"));
        }

        tracing::info!("JWT service initialized with HS256 key");

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: config.issuer.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            session_expiry_hours: config.session_expiry_hours,
        })
    }

    /// Short-lived token bound to the session's current refresh counter.
    pub fn generate_access_token(&self, session: &Session) -> Result<String, SessionError> {
        self.sign(
            session,
            TokenUse::Access,
            Duration::minutes(self.access_token_expiry_minutes),
        )
    }

    /// Refresh token; lives as long as a session.
    pub fn generate_refresh_token(&self, session: &Session) -> Result<String, SessionError> {
        self.sign(
            session,
            TokenUse::Refresh,
            Duration::hours(self.session_expiry_hours),
        )
    }

    fn sign(
        &self,
        session: &Session,
        token_use: TokenUse,
        lifetime: Duration,
    ) -> Result<String, SessionError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sid: session.session_id,
            sub: session.user_id,
            did: session.device_id,
            rc: session.refresh_count,
            token_use,
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + lifetime).timestamp(),
        };

        Ok(encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.encoding_key,
        )?)
    }

    /// Check signature, issuer, expiry and intended use.
    pub fn validate(&self, token: &str, expected: TokenUse) -> Result<SessionClaims, SessionError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => SessionError::TokenExpired,
                _ => SessionError::InvalidToken(e.to_string()),
            })?
            .claims;

        if claims.token_use != expected {
            return Err(SessionError::WrongTokenUse(expected.as_str()));
        }
        Ok(claims)
    }

    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }

    pub fn session_lifetime(&self) -> Duration {
        Duration::hours(self.session_expiry_hours)
    }
}
