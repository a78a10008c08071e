//! Authentication attempt records and their typed detail map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::ClientMeta;

/// A single value in an audit detail map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<DetailValue>),
    Map(BTreeMap<String, DetailValue>),
}

impl From<&str> for DetailValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for DetailValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for DetailValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for DetailValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for DetailValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<DetailValue>> From<Vec<T>> for DetailValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Keyed audit details. Serialized to JSON only when written to storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditDetails(BTreeMap<String, DetailValue>);

impl AuditDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<DetailValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<DetailValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&DetailValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(DetailValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}

/// One append-only authentication attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticationLog {
    pub log_id: Uuid,
    pub user_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub auth_type: String,
    pub success_flag: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: AuditDetails,
    pub created_utc: DateTime<Utc>,
}

impl AuthenticationLog {
    pub fn new(
        auth_type: &str,
        success_flag: bool,
        user_id: Option<Uuid>,
        device_id: Option<Uuid>,
        client: &ClientMeta,
        details: AuditDetails,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            user_id,
            device_id,
            auth_type: auth_type.to_string(),
            success_flag,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            details,
            created_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_serialize_as_plain_json() {
        let details = AuditDetails::new()
            .with("device_type", "yubikey")
            .with("permissions_checked", vec!["custody:read"])
            .with("attempt", 2i64)
            .with("replay", false);

        let json = details.to_json();
        assert_eq!(
            json,
            serde_json::json!({
                "attempt": 2,
                "device_type": "yubikey",
                "permissions_checked": ["custody:read"],
                "replay": false,
            })
        );
    }

    #[test]
    fn details_deserialize_nested_values() {
        let details: AuditDetails = serde_json::from_value(serde_json::json!({
            "ratio": 0.5,
            "nested": { "ok": true, "tags": ["a", "b"] }
        }))
        .unwrap();

        assert_eq!(details.get("ratio"), Some(&DetailValue::Float(0.5)));
        match details.get("nested") {
            Some(DetailValue::Map(map)) => {
                assert_eq!(map.get("ok"), Some(&DetailValue::Bool(true)));
                assert_eq!(
                    map.get("tags"),
                    Some(&DetailValue::List(vec!["a".into(), "b".into()]))
                );
            }
            other => panic!("expected nested map, got {:?}", other),
        }
    }
}
