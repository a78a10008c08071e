//! Transactional device custody changes with an append-only history.
//!
//! Every mutation authenticates the registrar first, then runs all checks and
//! writes inside one custody transaction. The transaction rolls back when it is
//! dropped without `commit`, so the device row and the ledger never diverge.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{
    ClientMeta, DeregistrationReason, Device, DeviceRegistration, DeviceType, NewRegistration,
    RegistrationHistoryEntry, UserSummary,
};
use crate::services::authenticator::{Authenticator, Credential};
use crate::services::error::CustodyError;
use crate::services::metrics::CUSTODY_CHANGES_TOTAL;
use crate::services::store::{CustodyTransaction, IdentityStore};
use crate::services::verifier::normalize_otp_identifier;

pub const PERMISSION_REGISTER_OTHER: &str = "custody:register-other";
pub const PERMISSION_DEREGISTER_OTHER: &str = "custody:deregister-other";
pub const PERMISSION_READ: &str = "custody:read";

/// How the caller names the user receiving a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetUser {
    Id(Uuid),
    Email(String),
}

#[derive(Debug, Clone)]
pub struct RegisterDevice {
    pub target: TargetUser,
    pub device_type: DeviceType,
    /// Public identifier. For hardware OTP devices a full OTP is also accepted.
    pub identifier: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeregisterDevice {
    pub reason: DeregistrationReason,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferDevice {
    pub target: TargetUser,
    pub notes: Option<String>,
}

/// Committed result of a custody mutation.
#[derive(Debug, Clone)]
pub struct CustodyChange {
    pub device: Device,
    /// Rows appended, in insertion order.
    pub registrations: Vec<DeviceRegistration>,
}

#[derive(Clone)]
pub struct CustodyLedger {
    authenticator: Authenticator,
    store: Arc<dyn IdentityStore>,
}

impl CustodyLedger {
    pub fn new(authenticator: Authenticator, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            authenticator,
            store,
        }
    }

    #[instrument(skip_all, fields(device_type = %request.device_type))]
    pub async fn register_device(
        &self,
        registrar: &Credential,
        request: RegisterDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        let result = self.register(registrar, request, client).await;
        record_change("register", &result);
        result
    }

    async fn register(
        &self,
        registrar: &Credential,
        request: RegisterDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        // Checked first so a malformed request never spends the registrar's OTP.
        let identifier = normalize_identifier(request.device_type, &request.identifier)?;
        let caller = self
            .authenticator
            .authenticate(registrar, &[PERMISSION_REGISTER_OTHER], client)
            .await?;
        let target_id = self.resolve_target(&request.target).await?;

        let mut tx = self.store.begin_custody().await?;
        ensure_active_target(&mut tx, target_id).await?;

        let mut device = tx
            .find_device_by_type_and_identifier(request.device_type, &identifier)
            .await?
            .unwrap_or_else(|| Device::new_unowned(request.device_type, identifier.clone()));

        if device.user_id.is_some_and(|owner| owner != target_id) {
            return Err(CustodyError::AlreadyRegistered);
        }

        device.user_id = Some(target_id);
        device.active_flag = true;
        device.verified_utc = Some(Utc::now());
        tx.save_device(&device).await?;

        let row = tx
            .insert_registration(NewRegistration::register(
                caller.user_id(),
                device.device_id,
                target_id,
                clean_notes(request.notes),
                client,
            ))
            .await?;
        tx.commit().await?;

        tracing::info!(
            device_id = %device.device_id,
            target_user_id = %target_id,
            registrar_user_id = %caller.user_id(),
            "Device registered"
        );

        Ok(CustodyChange {
            device,
            registrations: vec![row],
        })
    }

    #[instrument(skip(self, registrar, request, client))]
    pub async fn deregister_device(
        &self,
        registrar: &Credential,
        device_id: Uuid,
        request: DeregisterDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        let result = self.deregister(registrar, device_id, request, client).await;
        record_change("deregister", &result);
        result
    }

    async fn deregister(
        &self,
        registrar: &Credential,
        device_id: Uuid,
        request: DeregisterDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        let caller = self
            .authenticator
            .authenticate(registrar, &[PERMISSION_DEREGISTER_OTHER], client)
            .await?;

        let mut tx = self.store.begin_custody().await?;
        let mut device = tx
            .lock_device(device_id)
            .await?
            .ok_or(CustodyError::DeviceNotFound)?;
        let Some(previous_owner) = device.user_id else {
            return Err(CustodyError::NotRegistered);
        };

        device.user_id = None;
        device.active_flag = false;
        tx.save_device(&device).await?;

        let row = tx
            .insert_registration(NewRegistration::deregister(
                caller.user_id(),
                device.device_id,
                request.reason,
                clean_notes(request.notes),
                client,
            ))
            .await?;
        tx.commit().await?;

        tracing::info!(
            device_id = %device_id,
            previous_owner = %previous_owner,
            reason = %request.reason,
            "Device deregistered"
        );

        Ok(CustodyChange {
            device,
            registrations: vec![row],
        })
    }

    /// Move ownership in one update, recorded as a deregister row followed by
    /// a register row.
    #[instrument(skip(self, registrar, request, client))]
    pub async fn transfer_device(
        &self,
        registrar: &Credential,
        device_id: Uuid,
        request: TransferDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        let result = self.transfer(registrar, device_id, request, client).await;
        record_change("transfer", &result);
        result
    }

    async fn transfer(
        &self,
        registrar: &Credential,
        device_id: Uuid,
        request: TransferDevice,
        client: &ClientMeta,
    ) -> Result<CustodyChange, CustodyError> {
        let caller = self
            .authenticator
            .authenticate(
                registrar,
                &[PERMISSION_REGISTER_OTHER, PERMISSION_DEREGISTER_OTHER],
                client,
            )
            .await?;
        let target_id = self.resolve_target(&request.target).await?;

        let mut tx = self.store.begin_custody().await?;
        ensure_active_target(&mut tx, target_id).await?;

        let mut device = tx
            .lock_device(device_id)
            .await?
            .ok_or(CustodyError::DeviceNotFound)?;
        let Some(previous_owner) = device.user_id else {
            return Err(CustodyError::NotRegistered);
        };
        if previous_owner == target_id {
            return Err(CustodyError::SameOwner);
        }

        device.user_id = Some(target_id);
        tx.save_device(&device).await?;

        let notes = clean_notes(request.notes);
        let released = tx
            .insert_registration(NewRegistration::deregister(
                caller.user_id(),
                device.device_id,
                DeregistrationReason::DeviceTransfer,
                Some(with_notes(
                    format!(
                        "Transferred from user {} to user {}.",
                        previous_owner, target_id
                    ),
                    notes.as_deref(),
                )),
                client,
            ))
            .await?;
        let assigned = tx
            .insert_registration(NewRegistration::register(
                caller.user_id(),
                device.device_id,
                target_id,
                Some(with_notes(
                    format!("Transferred from user {}.", previous_owner),
                    notes.as_deref(),
                )),
                client,
            ))
            .await?;
        tx.commit().await?;

        tracing::info!(
            device_id = %device_id,
            previous_owner = %previous_owner,
            target_user_id = %target_id,
            "Device transferred"
        );

        Ok(CustodyChange {
            device,
            registrations: vec![released, assigned],
        })
    }

    /// History for a caller presenting a device credential with `custody:read`.
    pub async fn device_history_for(
        &self,
        caller: &Credential,
        device_id: Uuid,
        client: &ClientMeta,
    ) -> Result<Vec<RegistrationHistoryEntry>, CustodyError> {
        self.authenticator
            .authenticate(caller, &[PERMISSION_READ], client)
            .await?;
        self.device_history(device_id).await
    }

    /// History for a session-authenticated user holding `custody:read`.
    pub async fn device_history_for_user(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Vec<RegistrationHistoryEntry>, CustodyError> {
        self.authenticator
            .authorize_user(user_id, &[PERMISSION_READ])
            .await?;
        self.device_history(device_id).await
    }

    /// All ledger rows for the device, newest first, participants resolved.
    #[instrument(skip(self))]
    pub async fn device_history(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<RegistrationHistoryEntry>, CustodyError> {
        let device = self.store.find_device_by_id(device_id).await?;
        let rows = self.store.list_device_history(device_id).await?;
        if device.is_none() && rows.is_empty() {
            return Err(CustodyError::DeviceNotFound);
        }

        let mut users: HashMap<Uuid, Option<UserSummary>> = HashMap::new();
        let mut entries = Vec::with_capacity(rows.len());
        for registration in rows {
            let registrar = self
                .user_summary(&mut users, registration.registrar_user_id)
                .await?;
            let target_user = match registration.target_user_id {
                Some(id) => self.user_summary(&mut users, id).await?,
                None => None,
            };
            entries.push(RegistrationHistoryEntry {
                registration,
                registrar,
                target_user,
                device: device.clone(),
            });
        }
        Ok(entries)
    }

    async fn user_summary(
        &self,
        cache: &mut HashMap<Uuid, Option<UserSummary>>,
        user_id: Uuid,
    ) -> Result<Option<UserSummary>, CustodyError> {
        if let Some(summary) = cache.get(&user_id) {
            return Ok(summary.clone());
        }
        let summary = self
            .store
            .find_user_by_id(user_id)
            .await?
            .as_ref()
            .map(UserSummary::from);
        cache.insert(user_id, summary.clone());
        Ok(summary)
    }

    /// Email targets are resolved before the transaction opens.
    async fn resolve_target(&self, target: &TargetUser) -> Result<Uuid, CustodyError> {
        match target {
            TargetUser::Id(id) => Ok(*id),
            TargetUser::Email(email) => self
                .store
                .find_user_by_email(email.trim())
                .await?
                .map(|u| u.user_id)
                .ok_or(CustodyError::TargetUserNotFound),
        }
    }
}

async fn ensure_active_target(
    tx: &mut Box<dyn CustodyTransaction>,
    target_id: Uuid,
) -> Result<(), CustodyError> {
    let target = tx
        .find_user_by_id(target_id)
        .await?
        .ok_or(CustodyError::TargetUserNotFound)?;
    if !target.active_flag {
        return Err(CustodyError::TargetUserInactive);
    }
    Ok(())
}

fn normalize_identifier(device_type: DeviceType, raw: &str) -> Result<String, CustodyError> {
    match device_type {
        DeviceType::Yubikey => {
            normalize_otp_identifier(raw).map_err(|e| CustodyError::Validation(e.to_string()))
        }
        _ => {
            let identifier = raw.trim();
            if identifier.is_empty() {
                return Err(CustodyError::Validation(
                    "device identifier is required".to_string(),
                ));
            }
            Ok(identifier.to_string())
        }
    }
}

fn clean_notes(notes: Option<String>) -> Option<String> {
    notes
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

fn with_notes(summary: String, notes: Option<&str>) -> String {
    match notes {
        Some(notes) => format!("{} {}", summary, notes),
        None => summary,
    }
}

fn record_change(action: &str, result: &Result<CustodyChange, CustodyError>) {
    let status = if result.is_ok() { "committed" } else { "rejected" };
    CUSTODY_CHANGES_TOTAL
        .with_label_values(&[action, status])
        .inc();
    if let Err(e) = result {
        tracing::warn!(action, error = %e, "Custody change rejected");
    }
}
