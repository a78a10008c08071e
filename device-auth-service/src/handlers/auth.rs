use service_core::{
    axum::{extract::State, http::StatusCode, response::IntoResponse, Json},
    error::AppError,
};

use crate::{
    dtos::{
        auth::{
            AuthenticatedUser, DeviceAuthRequest, DeviceAuthResponse, DeviceSummary,
            SessionResponse, TokenResponse,
        },
        ErrorResponse,
    },
    handlers::context::ClientContext,
    services::Credential,
    utils::ValidatedJson,
    AppState,
};

/// Authenticate a device credential and check permissions
#[utoipa::path(
    post,
    path = "/api/v1/auth/device",
    request_body = DeviceAuthRequest,
    responses(
        (status = 200, description = "Device authenticated", body = DeviceAuthResponse),
        (status = 400, description = "Malformed credential or permission", body = ErrorResponse),
        (status = 401, description = "Authentication failed", body = ErrorResponse),
        (status = 403, description = "Permission denied", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "OTP authority unavailable", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn authenticate_device(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<DeviceAuthRequest>,
) -> Result<impl IntoResponse, AppError> {
    let credential = Credential::parse(&req.device_type, &req.auth_code)?;
    let required = req.required_permissions();

    let authenticated = state
        .authenticator
        .authenticate(&credential, &required, &client)
        .await?;

    Ok((
        StatusCode::OK,
        Json(DeviceAuthResponse {
            authenticated: true,
            user: AuthenticatedUser::from(&authenticated.user),
            device: DeviceSummary::from(&authenticated.device),
            permissions_checked: required,
        }),
    ))
}

/// Authenticate a device credential and open a bearer session
#[utoipa::path(
    post,
    path = "/api/v1/auth/session",
    request_body = DeviceAuthRequest,
    responses(
        (status = 201, description = "Session created", body = SessionResponse),
        (status = 400, description = "Malformed credential or permission", body = ErrorResponse),
        (status = 401, description = "Authentication failed", body = ErrorResponse),
        (status = 403, description = "Permission denied", body = ErrorResponse),
        (status = 429, description = "Too many attempts", body = ErrorResponse),
        (status = 503, description = "OTP authority unavailable", body = ErrorResponse)
    ),
    tag = "Sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    ValidatedJson(req): ValidatedJson<DeviceAuthRequest>,
) -> Result<impl IntoResponse, AppError> {
    let credential = Credential::parse(&req.device_type, &req.auth_code)?;
    let required = req.required_permissions();

    let authenticated = state
        .authenticator
        .authenticate(&credential, &required, &client)
        .await?;

    let session = state
        .sessions
        .create_session(authenticated.user_id(), authenticated.device.device_id)
        .await?;
    let tokens = state.sessions.issue_tokens(&session)?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            tokens: TokenResponse::from(tokens),
            user: AuthenticatedUser::from(&authenticated.user),
            device: DeviceSummary::from(&authenticated.device),
            session_expires_utc: session.expires_utc,
        }),
    ))
}
