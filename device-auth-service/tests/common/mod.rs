//! Shared fixtures for device-auth-service integration tests.
//!
//! Everything runs in-process: `MemoryStore` for identities and the ledger,
//! `MockSessionStore` for sessions and `ScriptedAuthority` standing in for the
//! Yubico endpoint.

#![allow(dead_code)]

use async_trait::async_trait;
use device_auth_service::{
    config::{
        AuthorizationConfig, DatabaseConfig, DeviceAuthConfig, Environment, JwtConfig,
        RateLimitConfig, RedisConfig, SecurityConfig, YubicoConfig,
    },
    models::{ClientMeta, Device, DeviceType, Permission, Role, User},
    services::{
        verifier::MODHEX_ALPHABET, Authenticator, CredentialVerifier, Credential, CustodyLedger,
        JwtService, MemoryStore, MockSessionStore, OtpAuthority, OtpStatus, PermissionResolver,
        SessionManager, VerificationError,
    },
    AppState,
};
use rand::Rng;
use secrecy::Secret;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static TRACING: Once = Once::new();

/// Route test logs through the env filter; `RUST_LOG=debug` to see them.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn test_config() -> DeviceAuthConfig {
    DeviceAuthConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "device-auth-service-test".to_string(),
        service_version: "0.0.0-test".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: "postgres://unused".to_string(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: RedisConfig {
            url: "redis://unused".to_string(),
        },
        jwt: JwtConfig {
            secret: Secret::new("integration-test-secret-with-32-bytes!".to_string()),
            issuer: "device-auth-test".to_string(),
            access_token_expiry_minutes: 15,
            session_expiry_hours: 24,
        },
        yubico: YubicoConfig {
            client_id: "12345".to_string(),
            api_url: "http://127.0.0.1:9/verify".to_string(),
            timeout_seconds: 1,
        },
        authorization: AuthorizationConfig {
            deny_overrides: false,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
        },
        rate_limit: RateLimitConfig {
            auth_attempts: 1000,
            auth_window_seconds: 60,
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        },
    }
}

/// In-process OTP authority.
///
/// Behaves like the real service by default: `OK` for a fresh OTP and
/// `REPLAYED_OTP` for one it has already seen. Queued verdicts take
/// precedence, one per call.
#[derive(Default)]
pub struct ScriptedAuthority {
    seen: Mutex<HashSet<String>>,
    queued: Mutex<VecDeque<Result<OtpStatus, VerificationError>>>,
    calls: Mutex<usize>,
}

impl ScriptedAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, verdict: Result<OtpStatus, VerificationError>) {
        self.queued.lock().unwrap().push_back(verdict);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl OtpAuthority for ScriptedAuthority {
    async fn validate(&self, otp: &str) -> Result<OtpStatus, VerificationError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(verdict) = self.queued.lock().unwrap().pop_front() {
            return verdict;
        }
        if self.seen.lock().unwrap().insert(otp.to_string()) {
            Ok(OtpStatus::Ok)
        } else {
            Ok(OtpStatus::ReplayedOtp)
        }
    }
}

fn modhex(len: usize) -> String {
    let alphabet: Vec<char> = MODHEX_ALPHABET.chars().collect();
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}

/// A fresh 12 character public identifier.
pub fn public_id() -> String {
    modhex(12)
}

/// A fresh 44 character OTP emitted by the token with `public_id`.
pub fn otp_for(public_id: &str) -> String {
    format!("{}{}", public_id, modhex(32))
}

/// A YubiKey credential carrying a never-seen OTP for `public_id`.
pub fn yubikey(public_id: &str) -> Credential {
    Credential::new(DeviceType::Yubikey, otp_for(public_id))
}

pub fn client() -> ClientMeta {
    ClientMeta::new(
        Some("198.51.100.20".to_string()),
        Some("integration-test".to_string()),
    )
}

/// Everything a test needs, built over in-memory adapters.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub sessions_store: Arc<MockSessionStore>,
    pub authority: Arc<ScriptedAuthority>,
    pub authenticator: Authenticator,
    pub sessions: SessionManager,
    pub custody: CustodyLedger,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_deny_overrides(false)
    }

    pub fn with_deny_overrides(deny_overrides: bool) -> Self {
        init_tracing();
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let sessions_store = Arc::new(MockSessionStore::new());
        let authority = Arc::new(ScriptedAuthority::new());

        let authenticator = Authenticator::new(
            store.clone(),
            CredentialVerifier::new(authority.clone()),
            PermissionResolver::new(deny_overrides),
        );
        let jwt = JwtService::new(&config.jwt).expect("Failed to create JWT service");
        let sessions = SessionManager::new(sessions_store.clone(), jwt);
        let custody = CustodyLedger::new(authenticator.clone(), store.clone());

        Self {
            store,
            sessions_store,
            authority,
            authenticator,
            sessions,
            custody,
        }
    }

    /// An active user holding one role with the given allow grants.
    pub async fn user_with(&self, name: &str, grants: &[(&str, &str)]) -> User {
        let user = User::new(format!("{}@example.com", name), name);
        self.store.insert_user(user.clone()).await;

        let role = Role::new(format!("{}-role", name));
        let permissions = grants
            .iter()
            .map(|(resource, action)| Permission::allow(*resource, *action))
            .collect();
        self.store.insert_role(role.clone(), permissions).await;
        self.store.assign_role(user.user_id, role.role_id).await;
        user
    }

    /// Attach an extra role to an existing user.
    pub async fn grant_role(&self, user_id: Uuid, name: &str, permissions: Vec<Permission>) {
        let role = Role::new(name);
        self.store.insert_role(role.clone(), permissions).await;
        self.store.assign_role(user_id, role.role_id).await;
    }

    /// An active YubiKey owned by `owner`; returns the device and its public id.
    pub async fn yubikey_for(&self, owner: Option<Uuid>) -> (Device, String) {
        let id = public_id();
        let mut device = Device::new_unowned(DeviceType::Yubikey, id.clone());
        device.user_id = owner;
        self.store.insert_device(device.clone()).await;
        (device, id)
    }

    /// A registrar allowed every custody operation, with their own token.
    pub async fn custodian(&self) -> (User, String) {
        let user = self
            .user_with(
                "custodian",
                &[
                    ("custody", "register-other"),
                    ("custody", "deregister-other"),
                    ("custody", "read"),
                ],
            )
            .await;
        let (_, id) = self.yubikey_for(Some(user.user_id)).await;
        (user, id)
    }

    /// Application state for HTTP tests, sharing this context's adapters.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            test_config(),
            self.store.clone(),
            self.sessions_store.clone(),
            self.authority.clone(),
        )
        .expect("Failed to build app state")
    }
}
