use std::sync::Arc;

use crate::models::AuthenticationLog;
use crate::services::error::StoreError;
use crate::services::store::IdentityStore;

/// Append-only sink for authentication attempts.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn IdentityStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: &AuthenticationLog) -> Result<(), StoreError> {
        self.store.insert_auth_log(entry).await?;
        tracing::info!(
            log_id = %entry.log_id,
            auth_type = %entry.auth_type,
            success = entry.success_flag,
            user_id = ?entry.user_id,
            device_id = ?entry.device_id,
            "Authentication attempt recorded"
        );
        Ok(())
    }

    /// Failure rows are best effort: a write error is logged, never surfaced.
    pub async fn record_best_effort(&self, entry: &AuthenticationLog) {
        if let Err(e) = self.record(entry).await {
            tracing::error!(
                error = %e,
                log_id = %entry.log_id,
                "Failed to write authentication log"
            );
        }
    }
}
