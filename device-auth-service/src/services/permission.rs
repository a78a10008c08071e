//! Role-based permission checks over a user's flattened grants.
//!
//! A requirement is either a permission UUID or `resource:action`. A
//! requirement is met when some role of the user carries a matching `allow`
//! grant. `deny` grants never satisfy a requirement; with `deny_overrides`
//! enabled they also veto matching allows. An empty requirement list means
//! authentication only.

use std::fmt;
use uuid::Uuid;

use crate::models::{Effect, Permission, UserWithRoles};
use crate::services::error::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionRequirement {
    Id(Uuid),
    ResourceAction { resource: String, action: String },
}

impl PermissionRequirement {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let value = raw.trim();
        if let Ok(id) = Uuid::parse_str(value) {
            return Ok(Self::Id(id));
        }
        match value.split_once(':') {
            Some((resource, action)) if !resource.is_empty() && !action.is_empty() => {
                Ok(Self::ResourceAction {
                    resource: resource.to_string(),
                    action: action.to_string(),
                })
            }
            _ => Err(AuthError::InvalidRequirement(value.to_string())),
        }
    }

    fn matches(&self, permission: &Permission) -> bool {
        match self {
            Self::Id(id) => permission.permission_id == *id,
            Self::ResourceAction { resource, action } => {
                permission.resource_name == *resource && permission.action == *action
            }
        }
    }
}

impl fmt::Display for PermissionRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{}", id),
            Self::ResourceAction { resource, action } => write!(f, "{}:{}", resource, action),
        }
    }
}

/// Parse every non-blank requirement; the first malformed one fails the batch.
pub fn parse_requirements<S: AsRef<str>>(
    raw: &[S],
) -> Result<Vec<PermissionRequirement>, AuthError> {
    raw.iter()
        .map(AsRef::as_ref)
        .filter(|s| !s.trim().is_empty())
        .map(PermissionRequirement::parse)
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionResolver {
    deny_overrides: bool,
}

impl PermissionResolver {
    pub fn new(deny_overrides: bool) -> Self {
        Self { deny_overrides }
    }

    pub fn is_satisfied(&self, user: &UserWithRoles, requirement: &PermissionRequirement) -> bool {
        let mut allowed = false;
        for permission in user.permissions().filter(|p| requirement.matches(p)) {
            match permission.effect {
                Effect::Allow => allowed = true,
                Effect::Deny if self.deny_overrides => return false,
                Effect::Deny => {}
            }
        }
        allowed
    }

    /// First requirement the user does not meet, if any.
    pub fn first_unsatisfied<'a>(
        &self,
        user: &UserWithRoles,
        requirements: &'a [PermissionRequirement],
    ) -> Option<&'a PermissionRequirement> {
        requirements.iter().find(|r| !self.is_satisfied(user, r))
    }

    /// All requirements ANDed. Malformed requirements are an error.
    pub fn authorize<S: AsRef<str>>(
        &self,
        user: &UserWithRoles,
        required: &[S],
    ) -> Result<bool, AuthError> {
        let requirements = parse_requirements(required)?;
        Ok(self.first_unsatisfied(user, &requirements).is_none())
    }
}
