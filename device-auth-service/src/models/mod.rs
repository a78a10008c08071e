//! Domain models for device-auth-service.

pub mod auth_log;
pub mod device;
pub mod registration;
pub mod session;
pub mod user;

pub use auth_log::{AuditDetails, AuthenticationLog, DetailValue};
pub use device::{Device, DeviceType};
pub use registration::{
    DeregistrationReason, DeviceRegistration, NewRegistration, RegistrationAction,
    RegistrationHistoryEntry,
};
pub use session::Session;
pub use user::{Effect, Permission, Role, RoleWithPermissions, User, UserSummary, UserWithRoles};

use serde::{Deserialize, Serialize};

/// Caller metadata captured at the HTTP boundary. Only ever written to
/// audit and ledger rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }
}
