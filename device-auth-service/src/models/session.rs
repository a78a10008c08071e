use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bearer session kept in the TTL store.
///
/// `refresh_count` is the anti-replay counter: every token carries a snapshot
/// of it and is only honoured while the snapshot matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    /// Filled from the store's access counter when a token is accepted.
    pub access_count: i64,
    pub refresh_count: i64,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub valid_flag: bool,
}

impl Session {
    pub fn new(user_id: Uuid, device_id: Uuid, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            device_id,
            access_count: 0,
            refresh_count: 0,
            created_utc: now,
            expires_utc: now + lifetime,
            valid_flag: true,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_utc
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        (self.expires_utc - now)
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }
}
