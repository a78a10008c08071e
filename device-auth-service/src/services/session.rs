//! Bearer session lifecycle: created, refreshed any number of times, then
//! invalidated or expired.
//!
//! Every token embeds the session's refresh counter at issue time. A refresh
//! increments the counter, so all earlier access tokens and the presented
//! refresh token stop matching. Concurrent refreshes of the same session are
//! last-write-wins on the counter. Accepting an access token only compares;
//! the access count lives in its own store counter so a reader can never
//! write back a stale refresh counter or validity flag.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::models::Session;
use crate::services::error::SessionError;
use crate::services::jwt::{JwtService, SessionClaims, TokenUse};
use crate::services::metrics::SESSION_EVENTS_TOTAL;
use crate::services::redis::SessionStore;

/// Token response returned to client
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub session_id: Uuid,
}

/// A session that just accepted an access token.
#[derive(Debug, Clone)]
pub struct SessionAccess {
    pub claims: SessionClaims,
    pub session: Session,
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    jwt: JwtService,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, jwt: JwtService) -> Self {
        Self { store, jwt }
    }

    #[instrument(skip(self))]
    pub async fn create_session(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Session, SessionError> {
        let session = Session::new(user_id, device_id, self.jwt.session_lifetime());
        self.persist(&session).await?;

        record_event("created");
        tracing::info!(session_id = %session.session_id, "Session created");
        Ok(session)
    }

    /// Mint an access and refresh token bound to the session's current counter.
    pub fn issue_tokens(&self, session: &Session) -> Result<TokenPair, SessionError> {
        Ok(TokenPair {
            access_token: self.jwt.generate_access_token(session)?,
            refresh_token: self.jwt.generate_refresh_token(session)?,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
            session_id: session.session_id,
        })
    }

    /// Load a usable session: present, valid and unexpired.
    pub async fn get_session(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or(SessionError::NotFound)?;

        if !session.valid_flag {
            return Err(SessionError::Invalidated);
        }
        if session.is_expired_at(Utc::now()) {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    /// Signature, issuer, expiry and token-use check only.
    pub fn validate_access_token(&self, token: &str) -> Result<SessionClaims, SessionError> {
        self.jwt.validate(token, TokenUse::Access)
    }

    /// Accept an access token against the live session and count the access.
    #[instrument(skip_all)]
    pub async fn authorize_access(&self, token: &str) -> Result<SessionAccess, SessionError> {
        let result = self.try_authorize_access(token).await;
        if let Err(ref e) = result {
            record_event("rejected");
            tracing::info!(error = %e, "Access token rejected");
        }
        result
    }

    async fn try_authorize_access(&self, token: &str) -> Result<SessionAccess, SessionError> {
        let claims = self.validate_access_token(token)?;
        let mut session = self.get_session(claims.sid).await?;
        check_binding(&claims, &session)?;

        let ttl = session
            .remaining_at(Utc::now())
            .ok_or(SessionError::Expired)?;
        session.access_count = self
            .store
            .record_access(session.session_id, ttl)
            .await
            .map_err(SessionError::Store)?;

        Ok(SessionAccess { claims, session })
    }

    /// Rotate the refresh counter and mint a new token pair.
    ///
    /// When `expected_session` is given the token must belong to that session.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
        expected_session: Option<Uuid>,
    ) -> Result<(Session, TokenPair), SessionError> {
        let result = self.try_refresh(refresh_token, expected_session).await;
        match &result {
            Ok((session, _)) => {
                record_event("refreshed");
                tracing::info!(
                    session_id = %session.session_id,
                    refresh_count = session.refresh_count,
                    "Session refreshed"
                );
            }
            Err(e) => {
                record_event("rejected");
                tracing::info!(error = %e, "Session refresh rejected");
            }
        }
        result
    }

    async fn try_refresh(
        &self,
        refresh_token: &str,
        expected_session: Option<Uuid>,
    ) -> Result<(Session, TokenPair), SessionError> {
        let claims = self.jwt.validate(refresh_token, TokenUse::Refresh)?;
        if expected_session.is_some_and(|id| id != claims.sid) {
            return Err(SessionError::SessionMismatch);
        }

        let mut session = self.get_session(claims.sid).await?;
        check_binding(&claims, &session)?;

        session.refresh_count += 1;
        self.persist(&session).await?;

        let tokens = self.issue_tokens(&session)?;
        Ok((session, tokens))
    }

    /// Mark the session invalid. Invalidating an invalid or expired session is
    /// a no-op.
    #[instrument(skip(self))]
    pub async fn invalidate_session(&self, session_id: Uuid) -> Result<(), SessionError> {
        let mut session = self
            .store
            .get_session(session_id)
            .await
            .map_err(SessionError::Store)?
            .ok_or(SessionError::NotFound)?;

        if !session.valid_flag || session.is_expired_at(Utc::now()) {
            return Ok(());
        }

        session.valid_flag = false;
        self.persist(&session).await?;

        record_event("invalidated");
        tracing::info!(session_id = %session_id, "Session invalidated");
        Ok(())
    }

    /// Store the session for the rest of its lifetime.
    async fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let ttl = session
            .remaining_at(Utc::now())
            .ok_or(SessionError::Expired)?;
        self.store
            .put_session(session, ttl)
            .await
            .map_err(SessionError::Store)
    }
}

fn check_binding(claims: &SessionClaims, session: &Session) -> Result<(), SessionError> {
    if claims.sub != session.user_id || claims.did != session.device_id {
        return Err(SessionError::InvalidToken(
            "token subject does not match session".to_string(),
        ));
    }
    if claims.rc != session.refresh_count {
        return Err(SessionError::CounterMismatch);
    }
    Ok(())
}

fn record_event(event: &str) {
    SESSION_EVENTS_TOTAL.with_label_values(&[event]).inc();
}
