use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::auth::DeviceSummary;
use crate::models::{
    DeviceRegistration, RegistrationAction, RegistrationHistoryEntry, UserSummary,
};
use crate::services::{CustodyChange, TargetUser};

/// Exactly one of `user_id` / `user_email` names the target.
fn into_target(user_id: Option<Uuid>, email: Option<String>) -> Option<TargetUser> {
    match (user_id, email) {
        (Some(id), None) => Some(TargetUser::Id(id)),
        (None, Some(email)) => Some(TargetUser::Email(email)),
        _ => None,
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RegisterDeviceRequest {
    pub user_id: Option<Uuid>,

    #[validate(email(message = "Invalid email format"))]
    #[schema(example = "jdoe@example.com")]
    pub user_email: Option<String>,

    #[validate(length(min = 1, max = 16, message = "Device type is required"))]
    #[schema(example = "yubikey")]
    pub device_type: String,

    /// Public identifier, or a full OTP for hardware tokens.
    #[validate(length(min = 1, max = 256, message = "Device identifier is required"))]
    #[schema(example = "cccjgjgkhcbb")]
    pub device_identifier: String,

    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

impl RegisterDeviceRequest {
    pub fn target(&self) -> Option<TargetUser> {
        into_target(self.user_id, self.user_email.clone())
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DeregisterDeviceRequest {
    #[validate(length(min = 1, message = "Reason is required"))]
    #[schema(example = "device_lost")]
    pub reason: String,

    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct TransferDeviceRequest {
    pub user_id: Option<Uuid>,

    #[validate(email(message = "Invalid email format"))]
    pub user_email: Option<String>,

    #[validate(length(max = 1000, message = "Notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

impl TransferDeviceRequest {
    pub fn target(&self) -> Option<TargetUser> {
        into_target(self.user_id, self.user_email.clone())
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegistrationRecord {
    pub registration_id: Uuid,
    pub ledger_seq: i64,
    pub registrar_user_id: Uuid,
    pub device_id: Uuid,
    pub target_user_id: Option<Uuid>,
    #[schema(value_type = String, example = "register")]
    pub action_type: RegistrationAction,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl From<&DeviceRegistration> for RegistrationRecord {
    fn from(row: &DeviceRegistration) -> Self {
        Self {
            registration_id: row.registration_id,
            ledger_seq: row.ledger_seq,
            registrar_user_id: row.registrar_user_id,
            device_id: row.device_id,
            target_user_id: row.target_user_id,
            action_type: row.action_type,
            reason: row.reason.clone(),
            notes: row.notes.clone(),
            created_utc: row.created_utc,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CustodyResponse {
    #[schema(example = "Device registered successfully")]
    pub message: String,
    pub device: DeviceSummary,
    pub owner_user_id: Option<Uuid>,
    pub registrations: Vec<RegistrationRecord>,
}

impl CustodyResponse {
    pub fn new(message: &str, change: &CustodyChange) -> Self {
        Self {
            message: message.to_string(),
            device: DeviceSummary::from(&change.device),
            owner_user_id: change.device.user_id,
            registrations: change
                .registrations
                .iter()
                .map(RegistrationRecord::from)
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryUser {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
}

impl From<&UserSummary> for HistoryUser {
    fn from(user: &UserSummary) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryEntryResponse {
    #[serde(flatten)]
    pub registration: RegistrationRecord,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub registrar: Option<HistoryUser>,
    pub target_user: Option<HistoryUser>,
}

impl From<&RegistrationHistoryEntry> for HistoryEntryResponse {
    fn from(entry: &RegistrationHistoryEntry) -> Self {
        Self {
            registration: RegistrationRecord::from(&entry.registration),
            ip_address: entry.registration.ip_address.clone(),
            user_agent: entry.registration.user_agent.clone(),
            registrar: entry.registrar.as_ref().map(HistoryUser::from),
            target_user: entry.target_user.as_ref().map(HistoryUser::from),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceHistoryResponse {
    pub device_id: Uuid,
    pub device: Option<DeviceSummary>,
    pub owner_user_id: Option<Uuid>,
    pub history: Vec<HistoryEntryResponse>,
}

impl DeviceHistoryResponse {
    pub fn new(device_id: Uuid, entries: &[RegistrationHistoryEntry]) -> Self {
        let device = entries.first().and_then(|e| e.device.as_ref());
        Self {
            device_id,
            device: device.map(DeviceSummary::from),
            owner_user_id: device.and_then(|d| d.user_id),
            history: entries.iter().map(HistoryEntryResponse::from).collect(),
        }
    }
}
