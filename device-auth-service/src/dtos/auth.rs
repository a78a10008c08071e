use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::models::{Device, DeviceType, Session, UserWithRoles};
use crate::services::{SessionClaims, TokenPair};

/// Device credential plus optional permissions to check.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct DeviceAuthRequest {
    #[validate(length(min = 1, max = 16, message = "Device type is required"))]
    #[schema(example = "yubikey")]
    pub device_type: String,

    #[validate(length(min = 1, max = 256, message = "Authentication code is required"))]
    #[schema(example = "cccjgjgkhcbbirdrfdnlnghhfgrtnnlgedjlftrbdeut")]
    pub auth_code: String,

    /// Single permission, `resource:action` or a permission id.
    #[schema(example = "doors:open")]
    pub permission: Option<String>,

    #[serde(default)]
    #[validate(length(max = 32, message = "At most 32 permissions may be checked"))]
    pub permissions: Vec<String>,
}

impl DeviceAuthRequest {
    /// `permission` and `permissions` combined, blanks dropped.
    pub fn required_permissions(&self) -> Vec<String> {
        self.permission
            .iter()
            .chain(self.permissions.iter())
            .filter(|p| !p.trim().is_empty())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    #[schema(example = "jdoe")]
    pub username: String,
    #[schema(example = "jdoe@example.com")]
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub roles: Vec<String>,
}

impl From<&UserWithRoles> for AuthenticatedUser {
    fn from(value: &UserWithRoles) -> Self {
        Self {
            user_id: value.user.user_id,
            username: value.user.username.clone(),
            email: value.user.email.clone(),
            first_name: value.user.first_name.clone(),
            last_name: value.user.last_name.clone(),
            roles: value.role_names(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceSummary {
    pub device_id: Uuid,
    #[schema(value_type = String, example = "yubikey")]
    pub device_type: DeviceType,
    #[schema(example = "cccjgjgkhcbb")]
    pub identifier: String,
    pub active: bool,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub verified_utc: Option<DateTime<Utc>>,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        Self {
            device_id: device.device_id,
            device_type: device.device_type,
            identifier: device.identifier.clone(),
            active: device.active_flag,
            last_used_utc: device.last_used_utc,
            verified_utc: device.verified_utc,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceAuthResponse {
    #[schema(example = true)]
    pub authenticated: bool,
    pub user: AuthenticatedUser,
    pub device: DeviceSummary,
    pub permissions_checked: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[schema(example = "Bearer")]
    pub token_type: String,
    /// Access token lifetime in seconds.
    #[schema(example = 900)]
    pub expires_in: i64,
    pub session_id: Uuid,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: pair.token_type,
            expires_in: pair.expires_in,
            session_id: pair.session_id,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub tokens: TokenResponse,
    pub user: AuthenticatedUser,
    pub device: DeviceSummary,
    pub session_expires_utc: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionValidationResponse {
    #[schema(example = true)]
    pub valid: bool,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub access_count: i64,
    pub refresh_count: i64,
    pub expires_utc: DateTime<Utc>,
    /// Access token expiry (Unix timestamp).
    pub token_expires_at: i64,
}

impl SessionValidationResponse {
    pub fn new(claims: &SessionClaims, session: &Session) -> Self {
        Self {
            valid: true,
            session_id: session.session_id,
            user_id: session.user_id,
            device_id: session.device_id,
            access_count: session.access_count,
            refresh_count: session.refresh_count,
            expires_utc: session.expires_utc,
            token_expires_at: claims.exp,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MessageResponse {
    #[schema(example = "Session invalidated")]
    pub message: String,
}
