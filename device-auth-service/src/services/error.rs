use service_core::error::AppError;
use thiserror::Error;

use crate::models::DeviceType;

/// Broad failure category shared by every service error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CredentialFormat,
    VerificationRejected,
    VerificationUnavailable,
    EntityState,
    AuthorizationDenied,
    Persistence,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            StoreError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::Internal(e) => AppError::DatabaseError(e),
        }
    }
}

/// Outcome of asking the credential verifier about a code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("invalid credential format: {0}")]
    InvalidFormat(String),

    #[error("device type {0} is not supported")]
    Unsupported(DeviceType),

    #[error("OTP has already been used")]
    ReplayedOtp,

    #[error("OTP is invalid")]
    BadOtp,

    #[error("OTP authority reported a missing parameter")]
    MissingParameter,

    #[error("OTP authority does not recognise this client")]
    NoSuchClient,

    #[error("OTP authority does not allow this operation")]
    OperationNotAllowed,

    #[error("OTP authority backend error")]
    BackendError,

    #[error("OTP authority returned unknown status '{0}'")]
    UnknownStatus(String),

    #[error("OTP verification unavailable: {0}")]
    Unavailable(String),
}

impl VerificationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidFormat(_) => ErrorKind::CredentialFormat,
            Self::Unavailable(_) => ErrorKind::VerificationUnavailable,
            _ => ErrorKind::VerificationRejected,
        }
    }

    /// Stable label used in audit details and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::Unsupported(_) => "unsupported_device_type",
            Self::ReplayedOtp => "replayed_otp",
            Self::BadOtp => "bad_otp",
            Self::MissingParameter => "missing_parameter",
            Self::NoSuchClient => "no_such_client",
            Self::OperationNotAllowed => "operation_not_allowed",
            Self::BackendError => "backend_error",
            Self::UnknownStatus(_) => "unknown_status",
            Self::Unavailable(_) => "verification_unavailable",
        }
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid permission requirement '{0}': expected a permission id or resource:action")]
    InvalidRequirement(String),

    #[error("{0}")]
    Verification(#[from] VerificationError),

    #[error("device not found")]
    DeviceNotFound,

    #[error("device is not active")]
    DeviceInactive,

    #[error("device is not registered to any user")]
    DeviceUnowned,

    #[error("user not found")]
    UserNotFound,

    #[error("user is not active")]
    UserInactive,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredential(_) | Self::InvalidRequirement(_) => ErrorKind::CredentialFormat,
            Self::Verification(e) => e.kind(),
            Self::DeviceNotFound
            | Self::DeviceInactive
            | Self::DeviceUnowned
            | Self::UserNotFound
            | Self::UserInactive => ErrorKind::EntityState,
            Self::PermissionDenied(_) => ErrorKind::AuthorizationDenied,
            Self::Store(_) => ErrorKind::Persistence,
        }
    }

    /// Stable label used in audit details and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidCredential(_) => "invalid_credential",
            Self::InvalidRequirement(_) => "invalid_requirement",
            Self::Verification(e) => e.label(),
            Self::DeviceNotFound => "device_not_found",
            Self::DeviceInactive => "device_inactive",
            Self::DeviceUnowned => "device_unowned",
            Self::UserNotFound => "user_not_found",
            Self::UserInactive => "user_inactive",
            Self::PermissionDenied(_) => "permission_failed",
            Self::Store(_) => "store_error",
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err.kind() {
            ErrorKind::CredentialFormat => {
                AppError::BadRequest(anyhow::anyhow!("Authentication failed: {}", err))
            }
            ErrorKind::VerificationUnavailable => {
                AppError::ServiceUnavailable(format!("Authentication failed: {}", err))
            }
            ErrorKind::VerificationRejected | ErrorKind::EntityState => {
                AppError::AuthError(anyhow::anyhow!("Authentication failed: {}", err))
            }
            ErrorKind::AuthorizationDenied => {
                AppError::Forbidden(anyhow::anyhow!("Authentication failed: {}", err))
            }
            ErrorKind::Persistence => match err {
                AuthError::Store(e) => e.into(),
                other => AppError::InternalError(anyhow::anyhow!(other.to_string())),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("session has been invalidated")]
    Invalidated,

    #[error("session has expired")]
    Expired,

    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token is not a {0} token")]
    WrongTokenUse(&'static str),

    #[error("token has been superseded by a session refresh")]
    CounterMismatch,

    #[error("session id does not match token")]
    SessionMismatch,

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("session store error: {0}")]
    Store(anyhow::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidToken(_) | Self::WrongTokenUse(_) => ErrorKind::CredentialFormat,
            Self::NotFound
            | Self::Invalidated
            | Self::Expired
            | Self::TokenExpired
            | Self::CounterMismatch
            | Self::SessionMismatch => ErrorKind::EntityState,
            Self::Signing(_) | Self::Store(_) => ErrorKind::Persistence,
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Signing(e) => AppError::InternalError(anyhow::Error::new(e)),
            SessionError::Store(e) => AppError::InternalError(e),
            SessionError::SessionMismatch => AppError::BadRequest(anyhow::anyhow!(
                "Session ID in URL does not match session ID in token"
            )),
            other => AppError::Unauthorized(anyhow::anyhow!("{}", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum CustodyError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Validation(String),

    #[error("target user not found")]
    TargetUserNotFound,

    #[error("target user is not active")]
    TargetUserInactive,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device is already registered to another user")]
    AlreadyRegistered,

    #[error("device is not currently registered to any user")]
    NotRegistered,

    #[error("device is already registered to the target user")]
    SameOwner,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CustodyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(e) => e.kind(),
            Self::Validation(_) => ErrorKind::CredentialFormat,
            Self::TargetUserNotFound
            | Self::TargetUserInactive
            | Self::DeviceNotFound
            | Self::AlreadyRegistered
            | Self::NotRegistered
            | Self::SameOwner => ErrorKind::EntityState,
            Self::Store(_) => ErrorKind::Persistence,
        }
    }
}

impl From<CustodyError> for AppError {
    fn from(err: CustodyError) -> Self {
        match err {
            CustodyError::Auth(e) => e.into(),
            CustodyError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            CustodyError::TargetUserNotFound | CustodyError::DeviceNotFound => {
                AppError::NotFound(anyhow::anyhow!("{}", err))
            }
            CustodyError::TargetUserInactive | CustodyError::NotRegistered => {
                AppError::BadRequest(anyhow::anyhow!("{}", err))
            }
            CustodyError::AlreadyRegistered | CustodyError::SameOwner => {
                AppError::Conflict(anyhow::anyhow!("{}", err))
            }
            CustodyError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::{http::StatusCode, response::IntoResponse};

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn replay_and_bad_otp_are_distinct_rejections() {
        let replay = AuthError::Verification(VerificationError::ReplayedOtp);
        let bad = AuthError::Verification(VerificationError::BadOtp);

        assert_eq!(replay.kind(), ErrorKind::VerificationRejected);
        assert_eq!(bad.kind(), ErrorKind::VerificationRejected);
        assert_ne!(replay.label(), bad.label());
    }

    #[test]
    fn auth_errors_map_to_http_statuses() {
        assert_eq!(
            status_of(AuthError::InvalidCredential("too short".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AuthError::Verification(VerificationError::Unavailable(
                "timeout".into()
            ))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_of(AuthError::DeviceInactive), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(AuthError::Verification(VerificationError::Unsupported(
                DeviceType::Sms
            ))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(AuthError::PermissionDenied("custody:read".into())),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn custody_errors_map_to_http_statuses() {
        assert_eq!(status_of(CustodyError::DeviceNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CustodyError::AlreadyRegistered), StatusCode::CONFLICT);
        assert_eq!(status_of(CustodyError::NotRegistered), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_errors_are_unauthorized() {
        assert_eq!(status_of(SessionError::CounterMismatch), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(SessionError::SessionMismatch), StatusCode::BAD_REQUEST);
    }
}
