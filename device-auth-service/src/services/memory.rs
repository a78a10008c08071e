//! In-process `IdentityStore` used by tests and local development.
//!
//! Custody transactions hold the store lock for their whole lifetime and stage
//! writes locally; nothing becomes visible until `commit`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::models::{
    registration::sort_newest_first, AuthenticationLog, Device, DeviceRegistration, DeviceType,
    NewRegistration, Permission, Role, RoleWithPermissions, User, UserWithRoles,
};
use crate::services::error::StoreError;
use crate::services::store::{CustodyTransaction, IdentityStore};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, RoleWithPermissions>,
    user_roles: HashMap<Uuid, Vec<Uuid>>,
    devices: HashMap<Uuid, Device>,
    auth_logs: Vec<AuthenticationLog>,
    registrations: Vec<DeviceRegistration>,
    next_ledger_seq: i64,
}

impl MemoryState {
    fn device_by_identifier(&self, device_type: DeviceType, identifier: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|d| d.device_type == device_type && d.identifier == identifier)
    }
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    // Counts down on each ledger insert; the insert that reaches zero fails.
    registration_failure: Arc<AtomicI64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            registration_failure: Arc::new(AtomicI64::new(-1)),
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.state.lock().await.users.insert(user.user_id, user);
    }

    pub async fn insert_role(&self, role: Role, permissions: Vec<Permission>) {
        self.state
            .lock()
            .await
            .roles
            .insert(role.role_id, RoleWithPermissions { role, permissions });
    }

    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) {
        self.state
            .lock()
            .await
            .user_roles
            .entry(user_id)
            .or_default()
            .push(role_id);
    }

    pub async fn insert_device(&self, device: Device) {
        self.state.lock().await.devices.insert(device.device_id, device);
    }

    pub async fn set_user_active(&self, user_id: Uuid, active: bool) {
        if let Some(user) = self.state.lock().await.users.get_mut(&user_id) {
            user.active_flag = active;
        }
    }

    pub async fn device(&self, device_id: Uuid) -> Option<Device> {
        self.state.lock().await.devices.get(&device_id).cloned()
    }

    pub async fn auth_logs(&self) -> Vec<AuthenticationLog> {
        self.state.lock().await.auth_logs.clone()
    }

    /// Ledger rows in insertion order.
    pub async fn registrations(&self) -> Vec<DeviceRegistration> {
        self.state.lock().await.registrations.clone()
    }

    /// Make the `nth` ledger insert from now on fail (1-based).
    pub fn fail_registration_insert(&self, nth: i64) {
        self.registration_failure.store(nth, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.state.lock().await.users.get(&user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_device_by_type_and_identifier(
        &self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .device_by_identifier(device_type, identifier)
            .cloned())
    }

    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        Ok(self.state.lock().await.devices.get(&device_id).cloned())
    }

    async fn load_user_with_roles(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserWithRoles>, StoreError> {
        let state = self.state.lock().await;
        let Some(user) = state.users.get(&user_id).cloned() else {
            return Ok(None);
        };
        let roles = state
            .user_roles
            .get(&user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.roles.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(UserWithRoles { user, roles }))
    }

    async fn touch_device_last_used(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let device = state
            .devices
            .get_mut(&device_id)
            .ok_or_else(|| StoreError::Internal(anyhow::anyhow!("device {} vanished", device_id)))?;
        device.last_used_utc = Some(at);
        Ok(())
    }

    async fn insert_auth_log(&self, log: &AuthenticationLog) -> Result<(), StoreError> {
        self.state.lock().await.auth_logs.push(log.clone());
        Ok(())
    }

    async fn list_device_history(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError> {
        let mut rows: Vec<DeviceRegistration> = self
            .state
            .lock()
            .await
            .registrations
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        sort_newest_first(&mut rows);
        Ok(rows)
    }

    async fn begin_custody(&self) -> Result<Box<dyn CustodyTransaction>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            guard,
            staged_devices: HashMap::new(),
            staged_registrations: Vec::new(),
            registration_failure: self.registration_failure.clone(),
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged_devices: HashMap<Uuid, Device>,
    staged_registrations: Vec<DeviceRegistration>,
    registration_failure: Arc<AtomicI64>,
}

impl MemoryTransaction {
    fn visible_device(&self, device_id: Uuid) -> Option<Device> {
        self.staged_devices
            .get(&device_id)
            .or_else(|| self.guard.devices.get(&device_id))
            .cloned()
    }
}

#[async_trait]
impl CustodyTransaction for MemoryTransaction {
    async fn find_user_by_id(&mut self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.guard.users.get(&user_id).cloned())
    }

    async fn find_device_by_type_and_identifier(
        &mut self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError> {
        let staged = self
            .staged_devices
            .values()
            .find(|d| d.device_type == device_type && d.identifier == identifier)
            .cloned();
        Ok(staged.or_else(|| self.guard.device_by_identifier(device_type, identifier).cloned()))
    }

    async fn lock_device(&mut self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        Ok(self.visible_device(device_id))
    }

    async fn save_device(&mut self, device: &Device) -> Result<(), StoreError> {
        let clash = self
            .guard
            .device_by_identifier(device.device_type, &device.identifier)
            .is_some_and(|d| d.device_id != device.device_id);
        if clash {
            return Err(StoreError::Conflict(format!(
                "device {}:{} already exists",
                device.device_type, device.identifier
            )));
        }
        self.staged_devices.insert(device.device_id, device.clone());
        Ok(())
    }

    async fn insert_registration(
        &mut self,
        registration: NewRegistration,
    ) -> Result<DeviceRegistration, StoreError> {
        if self.registration_failure.load(Ordering::SeqCst) > 0
            && self.registration_failure.fetch_sub(1, Ordering::SeqCst) == 1
        {
            return Err(StoreError::Internal(anyhow::anyhow!(
                "injected ledger insert failure"
            )));
        }

        self.guard.next_ledger_seq += 1;
        let row = registration.into_registration(self.guard.next_ledger_seq, Utc::now());
        self.staged_registrations.push(row.clone());
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard,
            staged_devices,
            staged_registrations,
            ..
        } = *self;
        guard.devices.extend(staged_devices);
        guard.registrations.extend(staged_registrations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientMeta, DeregistrationReason};

    #[tokio::test]
    async fn dropped_transaction_discards_staged_writes() {
        let store = MemoryStore::new();
        let device = Device::new_unowned(DeviceType::Yubikey, "cccccccccccb");
        store.insert_device(device.clone()).await;

        {
            let mut tx = store.begin_custody().await.unwrap();
            let mut locked = tx.lock_device(device.device_id).await.unwrap().unwrap();
            locked.active_flag = false;
            tx.save_device(&locked).await.unwrap();
            tx.insert_registration(NewRegistration::deregister(
                Uuid::new_v4(),
                device.device_id,
                DeregistrationReason::Administrative,
                None,
                &ClientMeta::default(),
            ))
            .await
            .unwrap();
        }

        assert!(store.device(device.device_id).await.unwrap().active_flag);
        assert!(store.registrations().await.is_empty());
    }

    #[tokio::test]
    async fn committed_transaction_is_visible() {
        let store = MemoryStore::new();
        let mut tx = store.begin_custody().await.unwrap();
        let device = Device::new_unowned(DeviceType::Email, "ops@example.com");
        tx.save_device(&device).await.unwrap();
        tx.commit().await.unwrap();

        let found = store
            .find_device_by_type_and_identifier(DeviceType::Email, "ops@example.com")
            .await
            .unwrap();
        assert_eq!(found.map(|d| d.device_id), Some(device.device_id));
    }

    #[tokio::test]
    async fn injected_failure_hits_requested_insert() {
        let store = MemoryStore::new();
        store.fail_registration_insert(2);
        let client = ClientMeta::default();

        let mut tx = store.begin_custody().await.unwrap();
        let first = tx
            .insert_registration(NewRegistration::register(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                &client,
            ))
            .await;
        assert!(first.is_ok());
        let second = tx
            .insert_registration(NewRegistration::register(
                Uuid::new_v4(),
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                &client,
            ))
            .await;
        assert!(second.is_err());
    }
}
