//! Authenticate-and-authorize orchestration.
//!
//! One call runs verifier, directory lookup, user load and permission checks in
//! order. Every failure after the credential has been parsed and the identifier
//! extracted is written to the audit log exactly once, after the decision is
//! final.

use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{AuditDetails, AuthenticationLog, ClientMeta, Device, DeviceType, UserWithRoles};
use crate::services::audit::AuditLog;
use crate::services::directory::DeviceDirectory;
use crate::services::error::{AuthError, VerificationError};
use crate::services::metrics::AUTH_ATTEMPTS_TOTAL;
use crate::services::permission::{parse_requirements, PermissionResolver};
use crate::services::store::IdentityStore;
use crate::services::verifier::CredentialVerifier;

/// A device type plus the proof code presented for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub device_type: DeviceType,
    pub code: String,
}

impl Credential {
    pub fn new(device_type: DeviceType, code: impl Into<String>) -> Self {
        Self {
            device_type,
            code: code.into(),
        }
    }

    pub fn parse(device_type: &str, code: &str) -> Result<Self, AuthError> {
        let device_type =
            DeviceType::from_str(device_type.trim()).map_err(AuthError::InvalidCredential)?;
        let code = code.trim();
        if code.is_empty() {
            return Err(AuthError::InvalidCredential(
                "authentication code is required".to_string(),
            ));
        }
        Ok(Self::new(device_type, code))
    }

    /// Parse the `<device_type>:<code>` form carried in an Authorization header.
    pub fn from_authorization(value: &str) -> Result<Self, AuthError> {
        let (device_type, code) = value.trim().split_once(':').ok_or_else(|| {
            AuthError::InvalidCredential(
                "expected credential in the form <device_type>:<code>".to_string(),
            )
        })?;
        Self::parse(device_type, code)
    }
}

/// The resolved identity of a successful authentication.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub user: UserWithRoles,
    pub device: Device,
}

impl Authenticated {
    pub fn user_id(&self) -> Uuid {
        self.user.user.user_id
    }
}

#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn IdentityStore>,
    verifier: CredentialVerifier,
    directory: DeviceDirectory,
    resolver: PermissionResolver,
    audit: AuditLog,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        verifier: CredentialVerifier,
        resolver: PermissionResolver,
    ) -> Self {
        Self {
            directory: DeviceDirectory::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            store,
            verifier,
            resolver,
        }
    }

    /// Verify `credential`, resolve its owner and check every requirement.
    ///
    /// Blank requirements are ignored; an empty list means authentication only.
    #[instrument(skip_all, fields(device_type = %credential.device_type))]
    pub async fn authenticate<S: AsRef<str>>(
        &self,
        credential: &Credential,
        required: &[S],
        client: &ClientMeta,
    ) -> Result<Authenticated, AuthError> {
        let device_type = credential.device_type;

        let requirements =
            parse_requirements(required).map_err(|e| count_outcome(device_type, e))?;

        let verification = match self.verifier.verify(device_type, &credential.code).await {
            Ok(verification) => verification,
            // Fails closed; no identifier was extracted so nothing is attached.
            Err(e @ VerificationError::Unsupported(_)) => {
                return Err(self
                    .fail(
                        AuthError::Verification(e),
                        device_type,
                        None,
                        None,
                        client,
                        AuditDetails::new(),
                    )
                    .await)
            }
            Err(e) => return Err(count_outcome(device_type, AuthError::from(e))),
        };

        let device = self
            .directory
            .lookup(device_type, &verification.identifier)
            .await
            .map_err(|e| count_outcome(device_type, e))?;

        if let Err(rejection) = verification.outcome {
            let details =
                AuditDetails::new().with("identifier", verification.identifier.as_str());
            return Err(self
                .fail(
                    AuthError::Verification(rejection),
                    device_type,
                    device.as_ref().and_then(|d| d.user_id),
                    device.as_ref().map(|d| d.device_id),
                    client,
                    details,
                )
                .await);
        }

        let Some(mut device) = device else {
            return Err(count_outcome(device_type, AuthError::DeviceNotFound));
        };

        if !device.active_flag {
            return Err(self
                .fail(
                    AuthError::DeviceInactive,
                    device_type,
                    device.user_id,
                    Some(device.device_id),
                    client,
                    AuditDetails::new(),
                )
                .await);
        }

        let Some(owner_id) = device.user_id else {
            return Err(self
                .fail(
                    AuthError::DeviceUnowned,
                    device_type,
                    None,
                    Some(device.device_id),
                    client,
                    AuditDetails::new(),
                )
                .await);
        };

        let user = match self.store.load_user_with_roles(owner_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return Err(self
                    .fail(
                        AuthError::UserNotFound,
                        device_type,
                        Some(owner_id),
                        Some(device.device_id),
                        client,
                        AuditDetails::new(),
                    )
                    .await)
            }
            Err(e) => return Err(count_outcome(device_type, e.into())),
        };

        if !user.user.active_flag {
            return Err(self
                .fail(
                    AuthError::UserInactive,
                    device_type,
                    Some(owner_id),
                    Some(device.device_id),
                    client,
                    AuditDetails::new(),
                )
                .await);
        }

        if let Some(failed) = self.resolver.first_unsatisfied(&user, &requirements) {
            let permission = failed.to_string();
            let details = AuditDetails::new().with("permission_checked", permission.as_str());
            return Err(self
                .fail(
                    AuthError::PermissionDenied(permission),
                    device_type,
                    Some(owner_id),
                    Some(device.device_id),
                    client,
                    details,
                )
                .await);
        }

        let used_at = self
            .directory
            .touch_last_used(device.device_id)
            .await
            .map_err(|e| count_outcome(device_type, e))?;
        device.last_used_utc = Some(used_at);

        let checked: Vec<String> = requirements.iter().map(ToString::to_string).collect();
        let entry = AuthenticationLog::new(
            device_type.as_str(),
            true,
            Some(owner_id),
            Some(device.device_id),
            client,
            AuditDetails::new()
                .with("device_type", device_type.as_str())
                .with("permissions_checked", checked),
        );
        self.audit
            .record(&entry)
            .await
            .map_err(|e| count_outcome(device_type, e.into()))?;

        AUTH_ATTEMPTS_TOTAL
            .with_label_values(&[device_type.as_str(), "success"])
            .inc();
        tracing::info!(
            user_id = %owner_id,
            device_id = %device.device_id,
            "Device authentication succeeded"
        );

        Ok(Authenticated { user, device })
    }

    /// Permission check for a caller already authenticated by a session.
    /// Nothing is audited; the session was established by `authenticate`.
    pub async fn authorize_user<S: AsRef<str>>(
        &self,
        user_id: Uuid,
        required: &[S],
    ) -> Result<UserWithRoles, AuthError> {
        let requirements = parse_requirements(required)?;
        let user = self
            .store
            .load_user_with_roles(user_id)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        if !user.user.active_flag {
            return Err(AuthError::UserInactive);
        }
        if let Some(failed) = self.resolver.first_unsatisfied(&user, &requirements) {
            return Err(AuthError::PermissionDenied(failed.to_string()));
        }
        Ok(user)
    }

    async fn fail(
        &self,
        error: AuthError,
        device_type: DeviceType,
        user_id: Option<Uuid>,
        device_id: Option<Uuid>,
        client: &ClientMeta,
        mut details: AuditDetails,
    ) -> AuthError {
        details.insert("failure_reason", error.label());
        details.insert("error", error.to_string());

        let entry = AuthenticationLog::new(
            device_type.as_str(),
            false,
            user_id,
            device_id,
            client,
            details,
        );
        self.audit.record_best_effort(&entry).await;

        tracing::warn!(
            reason = error.label(),
            user_id = ?user_id,
            device_id = ?device_id,
            "Device authentication failed"
        );
        count_outcome(device_type, error)
    }
}

fn count_outcome(device_type: DeviceType, error: AuthError) -> AuthError {
    AUTH_ATTEMPTS_TOTAL
        .with_label_values(&[device_type.as_str(), error.label()])
        .inc();
    error
}
