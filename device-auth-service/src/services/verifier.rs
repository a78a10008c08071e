//! Credential verification against the external OTP authority.
//!
//! Hardware OTPs are 44+ modhex characters; the first 12 are the token's public
//! identifier. The full OTP is validated by a Yubico-compatible endpoint:
//! `GET {api_url}?id=<client_id>&otp=<otp>&nonce=<40 hex chars>`, answered with
//! `key=value` lines (or a JSON object) carrying a `status` field.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use crate::config::YubicoConfig;
use crate::models::DeviceType;
use crate::services::error::VerificationError;
use crate::services::metrics::OTP_AUTHORITY_DURATION;

pub const MODHEX_ALPHABET: &str = "cbdefghijklnrtuv";
pub const OTP_MIN_LENGTH: usize = 44;
pub const PUBLIC_ID_LENGTH: usize = 12;

/// Status reported by the OTP authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpStatus {
    Ok,
    ReplayedOtp,
    BadOtp,
    MissingParameter,
    NoSuchClient,
    OperationNotAllowed,
    BackendError,
    Unknown(String),
}

impl OtpStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OK" => Self::Ok,
            "REPLAYED_OTP" => Self::ReplayedOtp,
            "BAD_OTP" => Self::BadOtp,
            "MISSING_PARAMETER" => Self::MissingParameter,
            "NO_SUCH_CLIENT" => Self::NoSuchClient,
            "OPERATION_NOT_ALLOWED" => Self::OperationNotAllowed,
            "BACKEND_ERROR" => Self::BackendError,
            _ => Self::Unknown(raw.trim().to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::ReplayedOtp => "replayed_otp",
            Self::BadOtp => "bad_otp",
            Self::MissingParameter => "missing_parameter",
            Self::NoSuchClient => "no_such_client",
            Self::OperationNotAllowed => "operation_not_allowed",
            Self::BackendError => "backend_error",
            Self::Unknown(_) => "unknown",
        }
    }

    fn into_outcome(self) -> Result<(), VerificationError> {
        match self {
            Self::Ok => Ok(()),
            Self::ReplayedOtp => Err(VerificationError::ReplayedOtp),
            Self::BadOtp => Err(VerificationError::BadOtp),
            Self::MissingParameter => Err(VerificationError::MissingParameter),
            Self::NoSuchClient => Err(VerificationError::NoSuchClient),
            Self::OperationNotAllowed => Err(VerificationError::OperationNotAllowed),
            Self::BackendError => Err(VerificationError::BackendError),
            Self::Unknown(s) => Err(VerificationError::UnknownStatus(s)),
        }
    }
}

/// External authority that validates one-time passwords.
///
/// Implementations return `Err` only when no verdict could be obtained
/// (`VerificationError::Unavailable`).
#[async_trait]
pub trait OtpAuthority: Send + Sync {
    async fn validate(&self, otp: &str) -> Result<OtpStatus, VerificationError>;
}

/// Yubico validation protocol client.
#[derive(Clone)]
pub struct YubicoClient {
    client: Client,
    api_url: String,
    client_id: String,
}

impl YubicoClient {
    pub fn new(config: &YubicoConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build OTP authority client: {}", e))?;

        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            client_id: config.client_id.clone(),
        })
    }
}

/// 20 random bytes, hex encoded.
pub fn generate_nonce() -> String {
    let bytes: [u8; 20] = rand::random();
    hex::encode(bytes)
}

/// Pull `status` out of a `key=value` line body or a JSON object body.
pub fn parse_status(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<serde_json::Value>(trimmed)
            .ok()?
            .get("status")?
            .as_str()
            .map(str::to_string);
    }

    trimmed.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "status").then(|| value.trim().to_string())
    })
}

#[async_trait]
impl OtpAuthority for YubicoClient {
    async fn validate(&self, otp: &str) -> Result<OtpStatus, VerificationError> {
        let nonce = generate_nonce();
        let timer = std::time::Instant::now();

        let response = self
            .client
            .get(&self.api_url)
            .query(&[
                ("id", self.client_id.as_str()),
                ("otp", otp),
                ("nonce", nonce.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                OTP_AUTHORITY_DURATION
                    .with_label_values(&["transport_error"])
                    .observe(timer.elapsed().as_secs_f64());
                if e.is_timeout() {
                    VerificationError::Unavailable("OTP authority timed out".to_string())
                } else {
                    VerificationError::Unavailable(format!("OTP authority request failed: {}", e))
                }
            })?;

        let http_status = response.status();
        let body = response.text().await.map_err(|e| {
            VerificationError::Unavailable(format!("Failed to read OTP authority response: {}", e))
        })?;

        tracing::debug!(status = %http_status, "OTP authority responded");

        if !http_status.is_success() {
            OTP_AUTHORITY_DURATION
                .with_label_values(&["http_error"])
                .observe(timer.elapsed().as_secs_f64());
            return Err(VerificationError::Unavailable(format!(
                "OTP authority returned HTTP {}",
                http_status
            )));
        }

        let status = parse_status(&body).map(|s| OtpStatus::parse(&s)).ok_or_else(|| {
            VerificationError::Unavailable("OTP authority response has no status".to_string())
        })?;

        OTP_AUTHORITY_DURATION
            .with_label_values(&[status.label()])
            .observe(timer.elapsed().as_secs_f64());

        Ok(status)
    }
}

/// Result of a verification whose identifier could be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub identifier: String,
    pub outcome: Result<(), VerificationError>,
}

/// Normalise a hardware OTP public identifier: lowercase, 12 modhex characters.
/// A full OTP is accepted and cut down to its identifier.
pub fn normalize_otp_identifier(raw: &str) -> Result<String, VerificationError> {
    let value = raw.trim().to_ascii_lowercase();
    if !is_modhex(&value) {
        return Err(VerificationError::InvalidFormat(
            "identifier must be modhex".to_string(),
        ));
    }
    match value.len() {
        PUBLIC_ID_LENGTH => Ok(value),
        n if n >= OTP_MIN_LENGTH => Ok(value[..PUBLIC_ID_LENGTH].to_string()),
        _ => Err(VerificationError::InvalidFormat(format!(
            "identifier must be {} modhex characters",
            PUBLIC_ID_LENGTH
        ))),
    }
}

fn is_modhex(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| MODHEX_ALPHABET.contains(c))
}

/// Dispatches verification per device type.
#[derive(Clone)]
pub struct CredentialVerifier {
    otp_authority: Arc<dyn OtpAuthority>,
}

impl CredentialVerifier {
    pub fn new(otp_authority: Arc<dyn OtpAuthority>) -> Self {
        Self { otp_authority }
    }

    /// `Err` means the code is malformed or the type is unsupported; no
    /// identifier is available. Authority verdicts live in `outcome`.
    pub async fn verify(
        &self,
        device_type: DeviceType,
        code: &str,
    ) -> Result<Verification, VerificationError> {
        match device_type {
            DeviceType::Yubikey => self.verify_otp(code).await,
            DeviceType::Totp | DeviceType::Sms | DeviceType::Email => {
                Err(VerificationError::Unsupported(device_type))
            }
        }
    }

    async fn verify_otp(&self, code: &str) -> Result<Verification, VerificationError> {
        let otp = code.trim().to_ascii_lowercase();
        if otp.len() < OTP_MIN_LENGTH {
            return Err(VerificationError::InvalidFormat(format!(
                "OTP must be at least {} characters",
                OTP_MIN_LENGTH
            )));
        }
        if !is_modhex(&otp) {
            return Err(VerificationError::InvalidFormat(
                "OTP must be modhex encoded".to_string(),
            ));
        }

        let identifier = otp[..PUBLIC_ID_LENGTH].to_string();
        let outcome = match self.otp_authority.validate(&otp).await {
            Ok(status) => status.into_outcome(),
            Err(e) => Err(e),
        };

        if let Err(ref e) = outcome {
            tracing::info!(identifier = %identifier, reason = e.label(), "OTP verification failed");
        }

        Ok(Verification {
            identifier,
            outcome,
        })
    }
}
