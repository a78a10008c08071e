//! Credential devices bound to users.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Kind of credential a device presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Hardware OTP token validated by a Yubico-compatible authority.
    Yubikey,
    Totp,
    Sms,
    Email,
}

impl DeviceType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yubikey => "yubikey",
            Self::Totp => "totp",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "yubikey" => Ok(Self::Yubikey),
            "totp" => Ok(Self::Totp),
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            other => Err(format!(
                "Invalid device type '{}'. Must be one of: yubikey, totp, sms, email",
                other
            )),
        }
    }
}

/// A credential device. `secret` never leaves the service.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Device {
    pub device_id: Uuid,
    pub user_id: Option<Uuid>,
    pub device_type: DeviceType,
    pub identifier: String,
    #[serde(skip_serializing, default)]
    pub secret: Option<String>,
    pub active_flag: bool,
    pub last_used_utc: Option<DateTime<Utc>>,
    pub verified_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

impl Device {
    /// A freshly discovered device with no owner yet.
    pub fn new_unowned(device_type: DeviceType, identifier: impl Into<String>) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            user_id: None,
            device_type,
            identifier: identifier.into(),
            secret: None,
            active_flag: true,
            last_used_utc: None,
            verified_utc: None,
            created_utc: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_type_parses_case_insensitively() {
        assert_eq!("YubiKey".parse::<DeviceType>(), Ok(DeviceType::Yubikey));
        assert_eq!(" sms ".parse::<DeviceType>(), Ok(DeviceType::Sms));
        assert!("u2f".parse::<DeviceType>().is_err());
    }

    #[test]
    fn secret_is_never_serialized() {
        let mut device = Device::new_unowned(DeviceType::Totp, "alice-phone");
        device.secret = Some("JBSWY3DPEHPK3PXP".to_string());

        let json = serde_json::to_value(&device).unwrap();
        assert!(json.get("secret").is_none());
        assert_eq!(json["device_type"], "totp");
    }
}
