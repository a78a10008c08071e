use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct User {
    pub user_id: Uuid,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub active_flag: bool,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            email: email.into(),
            username: username.into(),
            first_name: String::new(),
            last_name: String::new(),
            active_flag: true,
            created_utc: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Role {
    pub role_id: Uuid,
    pub role_name: String,
    pub description: Option<String>,
}

impl Role {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            role_name: role_name.into(),
            description: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// A grant (or explicit denial) of `action` on a named resource.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Permission {
    pub permission_id: Uuid,
    pub resource_name: String,
    pub action: String,
    pub effect: Effect,
}

impl Permission {
    pub fn allow(resource_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::with_effect(resource_name, action, Effect::Allow)
    }

    pub fn deny(resource_name: impl Into<String>, action: impl Into<String>) -> Self {
        Self::with_effect(resource_name, action, Effect::Deny)
    }

    fn with_effect(
        resource_name: impl Into<String>,
        action: impl Into<String>,
        effect: Effect,
    ) -> Self {
        Self {
            permission_id: Uuid::new_v4(),
            resource_name: resource_name.into(),
            action: action.into(),
            effect,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleWithPermissions {
    pub role: Role,
    pub permissions: Vec<Permission>,
}

/// Point-in-time snapshot of a user and their role/permission graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWithRoles {
    pub user: User,
    pub roles: Vec<RoleWithPermissions>,
}

impl UserWithRoles {
    /// All permissions across every role, duplicates included.
    pub fn permissions(&self) -> impl Iterator<Item = &Permission> {
        self.roles.iter().flat_map(|r| r.permissions.iter())
    }

    pub fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.role.role_name.clone()).collect()
    }
}

/// Outward-facing projection of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        }
    }
}
