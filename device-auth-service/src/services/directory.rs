use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::models::{Device, DeviceType};
use crate::services::error::AuthError;
use crate::services::store::IdentityStore;

/// Resolves presented identifiers to registered devices.
#[derive(Clone)]
pub struct DeviceDirectory {
    store: Arc<dyn IdentityStore>,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    pub async fn lookup(
        &self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, AuthError> {
        Ok(self
            .store
            .find_device_by_type_and_identifier(device_type, identifier)
            .await?)
    }

    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Device, AuthError> {
        self.lookup(device_type, identifier)
            .await?
            .ok_or(AuthError::DeviceNotFound)
    }

    /// Record a successful use; returns the timestamp written.
    pub async fn touch_last_used(
        &self,
        device_id: Uuid,
    ) -> Result<chrono::DateTime<Utc>, AuthError> {
        let now = Utc::now();
        self.store.touch_device_last_used(device_id, now).await?;
        Ok(now)
    }
}
