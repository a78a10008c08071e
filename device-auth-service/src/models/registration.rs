//! Custody ledger rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{ClientMeta, Device, UserSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RegistrationAction {
    Register,
    Deregister,
}

impl RegistrationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Deregister => "deregister",
        }
    }
}

impl std::fmt::Display for RegistrationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregistrationReason {
    UserLeft,
    DeviceLost,
    DeviceTransfer,
    Administrative,
}

impl DeregistrationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserLeft => "user_left",
            Self::DeviceLost => "device_lost",
            Self::DeviceTransfer => "device_transfer",
            Self::Administrative => "administrative",
        }
    }
}

impl std::fmt::Display for DeregistrationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeregistrationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_left" => Ok(Self::UserLeft),
            "device_lost" => Ok(Self::DeviceLost),
            "device_transfer" => Ok(Self::DeviceTransfer),
            "administrative" => Ok(Self::Administrative),
            other => Err(format!(
                "Invalid reason '{}'. Must be one of: user_left, device_lost, device_transfer, administrative",
                other
            )),
        }
    }
}

/// One append-only custody ledger row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub registration_id: Uuid,
    pub ledger_seq: i64,
    pub registrar_user_id: Uuid,
    pub device_id: Uuid,
    pub target_user_id: Option<Uuid>,
    pub action_type: RegistrationAction,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_utc: DateTime<Utc>,
}

/// Ledger row before the store assigns `ledger_seq` and `created_utc`.
#[derive(Debug, Clone)]
pub struct NewRegistration {
    pub registration_id: Uuid,
    pub registrar_user_id: Uuid,
    pub device_id: Uuid,
    pub target_user_id: Option<Uuid>,
    pub action_type: RegistrationAction,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewRegistration {
    pub fn register(
        registrar_user_id: Uuid,
        device_id: Uuid,
        target_user_id: Uuid,
        notes: Option<String>,
        client: &ClientMeta,
    ) -> Self {
        Self {
            registration_id: Uuid::new_v4(),
            registrar_user_id,
            device_id,
            target_user_id: Some(target_user_id),
            action_type: RegistrationAction::Register,
            reason: None,
            notes,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        }
    }

    pub fn deregister(
        registrar_user_id: Uuid,
        device_id: Uuid,
        reason: DeregistrationReason,
        notes: Option<String>,
        client: &ClientMeta,
    ) -> Self {
        Self {
            registration_id: Uuid::new_v4(),
            registrar_user_id,
            device_id,
            target_user_id: None,
            action_type: RegistrationAction::Deregister,
            reason: Some(reason.as_str().to_string()),
            notes,
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
        }
    }

    pub fn into_registration(self, ledger_seq: i64, created_utc: DateTime<Utc>) -> DeviceRegistration {
        DeviceRegistration {
            registration_id: self.registration_id,
            ledger_seq,
            registrar_user_id: self.registrar_user_id,
            device_id: self.device_id,
            target_user_id: self.target_user_id,
            action_type: self.action_type,
            reason: self.reason,
            notes: self.notes,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            created_utc,
        }
    }
}

/// Ledger row with its participants resolved for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationHistoryEntry {
    #[serde(flatten)]
    pub registration: DeviceRegistration,
    pub registrar: Option<UserSummary>,
    pub target_user: Option<UserSummary>,
    pub device: Option<Device>,
}

/// Newest first: `created_utc` descending, ties broken by `ledger_seq` descending.
pub fn sort_newest_first(rows: &mut [DeviceRegistration]) {
    rows.sort_by(|a, b| {
        b.created_utc
            .cmp(&a.created_utc)
            .then_with(|| b.ledger_seq.cmp(&a.ledger_seq))
    });
}
