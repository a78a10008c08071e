//! Services layer for device-auth-service.
//!
//! Credential verification, device directory, permission resolution,
//! authentication, sessions and the custody ledger, plus the storage adapters
//! they run on.

pub mod audit;
pub mod authenticator;
pub mod custody;
mod database;
pub mod directory;
pub mod error;
mod jwt;
pub mod memory;
pub mod metrics;
pub mod permission;
pub mod redis;
pub mod session;
pub mod store;
pub mod verifier;

pub use audit::AuditLog;
pub use authenticator::{Authenticated, Authenticator, Credential};
pub use custody::{
    CustodyChange, CustodyLedger, DeregisterDevice, RegisterDevice, TargetUser, TransferDevice,
};
pub use database::PgStore;
pub use directory::DeviceDirectory;
pub use error::{AuthError, CustodyError, ErrorKind, SessionError, StoreError, VerificationError};
pub use jwt::{JwtService, SessionClaims, TokenUse};
pub use memory::MemoryStore;
pub use permission::{PermissionRequirement, PermissionResolver};
pub use redis::{MockSessionStore, RedisSessionStore, SessionStore};
pub use session::{SessionAccess, SessionManager, TokenPair};
pub use store::{CustodyTransaction, IdentityStore};
pub use verifier::{CredentialVerifier, OtpAuthority, OtpStatus, Verification, YubicoClient};
