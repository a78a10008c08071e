//! Persistence contracts consumed by the authentication and custody services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AuthenticationLog, Device, DeviceRegistration, DeviceType, NewRegistration, User,
    UserWithRoles,
};
use crate::services::error::StoreError;

/// Read access to identities and devices plus the append-only sinks.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_device_by_type_and_identifier(
        &self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError>;

    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>, StoreError>;

    /// Load the user together with every role and permission in one snapshot.
    async fn load_user_with_roles(&self, user_id: Uuid)
        -> Result<Option<UserWithRoles>, StoreError>;

    async fn touch_device_last_used(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_auth_log(&self, log: &AuthenticationLog) -> Result<(), StoreError>;

    /// Ledger rows for a device, newest first.
    async fn list_device_history(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError>;

    /// Open a custody transaction. Dropping it without `commit` rolls back.
    async fn begin_custody(&self) -> Result<Box<dyn CustodyTransaction>, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// Unit of work spanning device ownership and ledger rows.
#[async_trait]
pub trait CustodyTransaction: Send {
    async fn find_user_by_id(&mut self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Look up and lock a device by its public identifier.
    async fn find_device_by_type_and_identifier(
        &mut self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError>;

    /// Look up and lock a device row for the rest of the transaction.
    async fn lock_device(&mut self, device_id: Uuid) -> Result<Option<Device>, StoreError>;

    /// Insert or update the device row.
    async fn save_device(&mut self, device: &Device) -> Result<(), StoreError>;

    async fn insert_registration(
        &mut self,
        registration: NewRegistration,
    ) -> Result<DeviceRegistration, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
