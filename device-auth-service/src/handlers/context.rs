//! Request extractors for caller metadata and credentials.

use service_core::axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::client_ip_from_parts;
use std::convert::Infallible;

use crate::models::ClientMeta;
use crate::services::Credential;

const MAX_USER_AGENT_LEN: usize = 512;

/// Caller IP and user agent, used only to enrich audit and ledger rows.
#[derive(Debug, Clone, Default)]
pub struct ClientContext(pub ClientMeta);

#[async_trait]
impl<S> FromRequestParts<S> for ClientContext
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip_address =
            client_ip_from_parts(&parts.headers, &parts.extensions).map(|ip| ip.to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect::<String>());

        Ok(ClientContext(ClientMeta::new(ip_address, user_agent)))
    }
}

fn authorization(parts: &Parts) -> Result<&str, AppError> {
    parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing Authorization header")))
}

fn bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// `Authorization: <device_type>:<code>`
#[derive(Debug, Clone)]
pub struct DeviceCredential(pub Credential);

#[async_trait]
impl<S> FromRequestParts<S> for DeviceCredential
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = authorization(parts)?;
        if bearer(value).is_some() {
            return Err(AppError::Unauthorized(anyhow::anyhow!(
                "A device credential is required for this operation"
            )));
        }
        Ok(DeviceCredential(Credential::from_authorization(value)?))
    }
}

/// `Authorization: Bearer <access token>`
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = authorization(parts)?;
        bearer(value)
            .map(|token| BearerToken(token.to_string()))
            .ok_or_else(|| {
                AppError::Unauthorized(anyhow::anyhow!("Missing or invalid bearer token"))
            })
    }
}

/// Either credential form, for routes that accept both.
#[derive(Debug, Clone)]
pub enum Caller {
    Device(Credential),
    Session(String),
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = authorization(parts)?;
        match bearer(value) {
            Some(token) => Ok(Caller::Session(token.to_string())),
            None => Ok(Caller::Device(Credential::from_authorization(value)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceType;
    use service_core::axum::http::Request;

    fn parts(authorization: Option<&str>) -> Parts {
        let mut builder = Request::builder()
            .uri("/")
            .header(header::USER_AGENT, "yk-cli/1.0")
            .header("x-forwarded-for", "198.51.100.7");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn client_context_reads_ip_and_user_agent() {
        let mut parts = parts(None);
        let ClientContext(meta) = ClientContext::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(meta.ip_address.as_deref(), Some("198.51.100.7"));
        assert_eq!(meta.user_agent.as_deref(), Some("yk-cli/1.0"));
    }

    #[tokio::test]
    async fn caller_distinguishes_bearer_from_device() {
        let mut session = parts(Some("Bearer abc.def.ghi"));
        assert!(matches!(
            Caller::from_request_parts(&mut session, &()).await,
            Ok(Caller::Session(t)) if t == "abc.def.ghi"
        ));

        let mut device = parts(Some("yubikey:cccjgjgkhcbbirdrfdnlnghhfgrtnnlgedjlftrbdeut"));
        match Caller::from_request_parts(&mut device, &()).await {
            Ok(Caller::Device(credential)) => {
                assert_eq!(credential.device_type, DeviceType::Yubikey)
            }
            other => panic!("unexpected caller: {:?}", other),
        }
    }

    #[tokio::test]
    async fn device_credential_rejects_bearer_and_missing_header() {
        let mut session = parts(Some("Bearer abc"));
        assert!(DeviceCredential::from_request_parts(&mut session, &())
            .await
            .is_err());

        let mut missing = parts(None);
        assert!(DeviceCredential::from_request_parts(&mut missing, &())
            .await
            .is_err());
    }
}
