//! PostgreSQL implementation of the identity and custody stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    AuthenticationLog, Device, DeviceRegistration, DeviceType, Effect, NewRegistration,
    Permission, Role, RoleWithPermissions, User, UserWithRoles,
};
use crate::services::error::StoreError;
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{CustodyTransaction, IdentityStore};

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct RoleGrantRow {
    role_id: Uuid,
    role_name: String,
    description: Option<String>,
    permission_id: Option<Uuid>,
    resource_name: Option<String>,
    action: Option<String>,
    effect: Option<Effect>,
}

fn group_role_grants(rows: Vec<RoleGrantRow>) -> Vec<RoleWithPermissions> {
    let mut roles: Vec<RoleWithPermissions> = Vec::new();
    for row in rows {
        if roles.last().map(|r| r.role.role_id) != Some(row.role_id) {
            roles.push(RoleWithPermissions {
                role: Role {
                    role_id: row.role_id,
                    role_name: row.role_name.clone(),
                    description: row.description.clone(),
                },
                permissions: Vec::new(),
            });
        }
        if let (Some(permission_id), Some(resource_name), Some(action), Some(effect), Some(role)) = (
            row.permission_id,
            row.resource_name,
            row.action,
            row.effect,
            roles.last_mut(),
        ) {
            role.permissions.push(Permission {
                permission_id,
                resource_name,
                action,
                effect,
            });
        }
    }
    roles
}

fn map_write_error(e: sqlx::Error, what: &str) -> StoreError {
    match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            StoreError::Conflict(format!("{} already exists", what))
        }
        other => StoreError::Database(other),
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_user_by_id"])
            .start_timer();

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, email, username, first_name, last_name, active_flag, created_utc
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(user)
    }

    #[instrument(skip(self, email))]
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_user_by_email"])
            .start_timer();

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, email, username, first_name, last_name, active_flag, created_utc
            FROM users
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(user)
    }

    #[instrument(skip(self), fields(device_type = %device_type))]
    async fn find_device_by_type_and_identifier(
        &self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_device_by_identifier"])
            .start_timer();

        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, user_id, device_type, identifier, secret, active_flag,
                   last_used_utc, verified_utc, created_utc
            FROM devices
            WHERE device_type = $1 AND identifier = $2
            "#,
        )
        .bind(device_type.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(device)
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_device_by_id"])
            .start_timer();

        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, user_id, device_type, identifier, secret, active_flag,
                   last_used_utc, verified_utc, created_utc
            FROM devices
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(device)
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    async fn load_user_with_roles(
        &self,
        user_id: Uuid,
    ) -> Result<Option<UserWithRoles>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["load_user_with_roles"])
            .start_timer();

        // Both reads share one snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, email, username, first_name, last_name, active_flag, created_utc
            FROM users
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user) = user else {
            timer.observe_duration();
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, RoleGrantRow>(
            r#"
            SELECT r.role_id, r.role_name, r.description,
                   p.permission_id, res.resource_name, p.action, p.effect
            FROM user_roles ur
            JOIN roles r ON r.role_id = ur.role_id
            LEFT JOIN role_permissions rp ON rp.role_id = r.role_id
            LEFT JOIN permissions p ON p.permission_id = rp.permission_id
            LEFT JOIN resources res ON res.resource_id = p.resource_id
            WHERE ur.user_id = $1
            ORDER BY r.role_name, r.role_id, res.resource_name, p.action
            "#,
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        timer.observe_duration();

        Ok(Some(UserWithRoles {
            user,
            roles: group_role_grants(rows),
        }))
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn touch_device_last_used(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["touch_device_last_used"])
            .start_timer();

        sqlx::query("UPDATE devices SET last_used_utc = $2 WHERE device_id = $1")
            .bind(device_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, log), fields(log_id = %log.log_id, success = log.success_flag))]
    async fn insert_auth_log(&self, log: &AuthenticationLog) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_auth_log"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO authentication_logs
                (log_id, user_id, device_id, auth_type, success_flag, ip_address, user_agent, details, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(log.log_id)
        .bind(log.user_id)
        .bind(log.device_id)
        .bind(&log.auth_type)
        .bind(log.success_flag)
        .bind(&log.ip_address)
        .bind(&log.user_agent)
        .bind(Json(&log.details))
        .bind(log.created_utc)
        .execute(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(device_id = %device_id))]
    async fn list_device_history(
        &self,
        device_id: Uuid,
    ) -> Result<Vec<DeviceRegistration>, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_device_history"])
            .start_timer();

        let rows = sqlx::query_as::<_, DeviceRegistration>(
            r#"
            SELECT registration_id, ledger_seq, registrar_user_id, device_id, target_user_id,
                   action_type, reason, notes, ip_address, user_agent, created_utc
            FROM device_registrations
            WHERE device_id = $1
            ORDER BY created_utc DESC, ledger_seq DESC
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        timer.observe_duration();
        Ok(rows)
    }

    async fn begin_custody(&self) -> Result<Box<dyn CustodyTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCustodyTransaction { tx }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Custody unit of work. Dropping the inner `sqlx::Transaction` rolls back.
struct PgCustodyTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl CustodyTransaction for PgCustodyTransaction {
    async fn find_user_by_id(&mut self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT user_id, email, username, first_name, last_name, active_flag, created_utc
            FROM users
            WHERE user_id = $1
            FOR SHARE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(user)
    }

    async fn find_device_by_type_and_identifier(
        &mut self,
        device_type: DeviceType,
        identifier: &str,
    ) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, user_id, device_type, identifier, secret, active_flag,
                   last_used_utc, verified_utc, created_utc
            FROM devices
            WHERE device_type = $1 AND identifier = $2
            FOR UPDATE
            "#,
        )
        .bind(device_type.as_str())
        .bind(identifier)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(device)
    }

    async fn lock_device(&mut self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        let device = sqlx::query_as::<_, Device>(
            r#"
            SELECT device_id, user_id, device_type, identifier, secret, active_flag,
                   last_used_utc, verified_utc, created_utc
            FROM devices
            WHERE device_id = $1
            FOR UPDATE
            "#,
        )
        .bind(device_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(device)
    }

    async fn save_device(&mut self, device: &Device) -> Result<(), StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_device"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO devices
                (device_id, user_id, device_type, identifier, secret, active_flag, last_used_utc, verified_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (device_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                active_flag = EXCLUDED.active_flag,
                last_used_utc = EXCLUDED.last_used_utc,
                verified_utc = EXCLUDED.verified_utc
            "#,
        )
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(device.device_type.as_str())
        .bind(&device.identifier)
        .bind(&device.secret)
        .bind(device.active_flag)
        .bind(device.last_used_utc)
        .bind(device.verified_utc)
        .bind(device.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            map_write_error(
                e,
                &format!("device {}:{}", device.device_type, device.identifier),
            )
        })?;

        timer.observe_duration();
        Ok(())
    }

    async fn insert_registration(
        &mut self,
        registration: NewRegistration,
    ) -> Result<DeviceRegistration, StoreError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_registration"])
            .start_timer();

        let row = sqlx::query_as::<_, DeviceRegistration>(
            r#"
            INSERT INTO device_registrations
                (registration_id, registrar_user_id, device_id, target_user_id, action_type,
                 reason, notes, ip_address, user_agent, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, clock_timestamp())
            RETURNING registration_id, ledger_seq, registrar_user_id, device_id, target_user_id,
                      action_type, reason, notes, ip_address, user_agent, created_utc
            "#,
        )
        .bind(registration.registration_id)
        .bind(registration.registrar_user_id)
        .bind(registration.device_id)
        .bind(registration.target_user_id)
        .bind(registration.action_type.as_str())
        .bind(&registration.reason)
        .bind(&registration.notes)
        .bind(&registration.ip_address)
        .bind(&registration.user_agent)
        .fetch_one(&mut *self.tx)
        .await?;

        timer.observe_duration();
        info!(
            registration_id = %row.registration_id,
            ledger_seq = row.ledger_seq,
            action = %row.action_type,
            "Custody ledger row written"
        );
        Ok(row)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}
