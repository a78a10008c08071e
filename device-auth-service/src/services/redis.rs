use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::Session;

/// TTL key-value store holding bearer sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Write the session, replacing any previous value; it expires after `ttl`.
    async fn put_session(&self, session: &Session, ttl: Duration) -> Result<(), anyhow::Error>;
    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, anyhow::Error>;
    /// Atomically bump the session's access counter and return the new value.
    /// Never touches the stored session itself.
    async fn record_access(&self, session_id: Uuid, ttl: Duration) -> Result<i64, anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

fn session_key(session_id: Uuid) -> String {
    format!("session:{}", session_id)
}

fn access_key(session_id: Uuid) -> String {
    format!("session:{}:accesses", session_id)
}

#[derive(Clone)]
pub struct RedisSessionStore {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisSessionStore {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!("Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put_session(&self, session: &Session, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(session)?;

        redis::cmd("SET")
            .arg(session_key(session.session_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to store session: {}", e))
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, anyhow::Error> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(session_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load session: {}", e))?;

        payload
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("Corrupt session {}: {}", session_id, e))
            })
            .transpose()
    }

    async fn record_access(&self, session_id: Uuid, ttl: Duration) -> Result<i64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = access_key(session_id);

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(&key)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to record session access: {}", e))?;
        Ok(count)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-process session store with TTL expiry.
#[derive(Default)]
pub struct MockSessionStore {
    sessions: std::sync::Mutex<HashMap<Uuid, (Session, Instant)>>,
    accesses: std::sync::Mutex<HashMap<Uuid, i64>>,
}

impl MockSessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a session as if its TTL had elapsed.
    pub fn expire(&self, session_id: Uuid) -> Result<(), anyhow::Error> {
        self.sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session store mutex poisoned: {}", e))?
            .remove(&session_id);
        self.accesses
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session store mutex poisoned: {}", e))?
            .remove(&session_id);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    async fn put_session(&self, session: &Session, ttl: Duration) -> Result<(), anyhow::Error> {
        self.sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session store mutex poisoned: {}", e))?
            .insert(session.session_id, (session.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, anyhow::Error> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session store mutex poisoned: {}", e))?;

        let expired = matches!(
            sessions.get(&session_id),
            Some((_, deadline)) if *deadline <= Instant::now()
        );
        if expired {
            sessions.remove(&session_id);
            return Ok(None);
        }
        Ok(sessions.get(&session_id).map(|(session, _)| session.clone()))
    }

    async fn record_access(&self, session_id: Uuid, _ttl: Duration) -> Result<i64, anyhow::Error> {
        let mut accesses = self
            .accesses
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock session store mutex poisoned: {}", e))?;
        let count = accesses.entry(session_id).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
