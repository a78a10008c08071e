use service_core::{
    axum::{
        extract::{Path, State},
        http::StatusCode,
        response::IntoResponse,
        Json,
    },
    error::AppError,
};
use uuid::Uuid;

use crate::{
    dtos::{
        devices::{
            CustodyResponse, DeregisterDeviceRequest, DeviceHistoryResponse,
            RegisterDeviceRequest, TransferDeviceRequest,
        },
        ErrorResponse,
    },
    handlers::context::{Caller, ClientContext, DeviceCredential},
    models::{DeregistrationReason, DeviceType},
    services::{CustodyError, DeregisterDevice, RegisterDevice, TransferDevice},
    utils::ValidatedJson,
    AppState,
};

fn missing_target() -> AppError {
    AppError::BadRequest(anyhow::anyhow!(
        "Exactly one of user_id or user_email is required"
    ))
}

/// Register a device to a user
#[utoipa::path(
    post,
    path = "/api/v1/devices/register",
    request_body = RegisterDeviceRequest,
    responses(
        (status = 201, description = "Device registered", body = CustodyResponse),
        (status = 400, description = "Invalid request or inactive target", body = ErrorResponse),
        (status = 401, description = "Registrar authentication failed", body = ErrorResponse),
        (status = 403, description = "Registrar lacks custody:register-other", body = ErrorResponse),
        (status = 404, description = "Target user not found", body = ErrorResponse),
        (status = 409, description = "Device already registered to another user", body = ErrorResponse)
    ),
    tag = "Devices",
    security(("device_credential" = []))
)]
pub async fn register_device(
    State(state): State<AppState>,
    ClientContext(client): ClientContext,
    DeviceCredential(registrar): DeviceCredential,
    ValidatedJson(req): ValidatedJson<RegisterDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let target = req.target().ok_or_else(missing_target)?;
    let device_type: DeviceType = req
        .device_type
        .parse()
        .map_err(CustodyError::Validation)?;

    let change = state
        .custody
        .register_device(
            &registrar,
            RegisterDevice {
                target,
                device_type,
                identifier: req.device_identifier,
                notes: req.notes,
            },
            &client,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CustodyResponse::new("Device registered successfully", &change)),
    ))
}

/// Remove a device from its owner
#[utoipa::path(
    post,
    path = "/api/v1/devices/deregister/{device_id}",
    params(("device_id" = Uuid, Path, description = "Device to deregister")),
    request_body = DeregisterDeviceRequest,
    responses(
        (status = 200, description = "Device deregistered", body = CustodyResponse),
        (status = 400, description = "Invalid reason or device not registered", body = ErrorResponse),
        (status = 401, description = "Registrar authentication failed", body = ErrorResponse),
        (status = 403, description = "Registrar lacks custody:deregister-other", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse)
    ),
    tag = "Devices",
    security(("device_credential" = []))
)]
pub async fn deregister_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    ClientContext(client): ClientContext,
    DeviceCredential(registrar): DeviceCredential,
    ValidatedJson(req): ValidatedJson<DeregisterDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let reason: DeregistrationReason = req.reason.parse().map_err(CustodyError::Validation)?;

    let change = state
        .custody
        .deregister_device(
            &registrar,
            device_id,
            DeregisterDevice {
                reason,
                notes: req.notes,
            },
            &client,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(CustodyResponse::new("Device deregistered successfully", &change)),
    ))
}

/// Move a device from its current owner to another user
#[utoipa::path(
    post,
    path = "/api/v1/devices/transfer/{device_id}",
    params(("device_id" = Uuid, Path, description = "Device to transfer")),
    request_body = TransferDeviceRequest,
    responses(
        (status = 200, description = "Device transferred", body = CustodyResponse),
        (status = 400, description = "Invalid request, inactive target or unregistered device", body = ErrorResponse),
        (status = 401, description = "Registrar authentication failed", body = ErrorResponse),
        (status = 403, description = "Registrar lacks custody permissions", body = ErrorResponse),
        (status = 404, description = "Device or target user not found", body = ErrorResponse),
        (status = 409, description = "Device already owned by target", body = ErrorResponse)
    ),
    tag = "Devices",
    security(("device_credential" = []))
)]
pub async fn transfer_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    ClientContext(client): ClientContext,
    DeviceCredential(registrar): DeviceCredential,
    ValidatedJson(req): ValidatedJson<TransferDeviceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let target = req.target().ok_or_else(missing_target)?;

    let change = state
        .custody
        .transfer_device(
            &registrar,
            device_id,
            TransferDevice {
                target,
                notes: req.notes,
            },
            &client,
        )
        .await?;

    Ok((
        StatusCode::OK,
        Json(CustodyResponse::new("Device transferred successfully", &change)),
    ))
}

/// Custody history of a device, newest first
#[utoipa::path(
    get,
    path = "/api/v1/devices/history/{device_id}",
    params(("device_id" = Uuid, Path, description = "Device whose history is requested")),
    responses(
        (status = 200, description = "Custody history", body = DeviceHistoryResponse),
        (status = 401, description = "Caller authentication failed", body = ErrorResponse),
        (status = 403, description = "Caller lacks custody:read", body = ErrorResponse),
        (status = 404, description = "Device not found", body = ErrorResponse)
    ),
    tag = "Devices",
    security(("device_credential" = []), ("bearer_auth" = []))
)]
pub async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
    ClientContext(client): ClientContext,
    caller: Caller,
) -> Result<impl IntoResponse, AppError> {
    let entries = match caller {
        Caller::Device(credential) => {
            state
                .custody
                .device_history_for(&credential, device_id, &client)
                .await?
        }
        Caller::Session(token) => {
            let access = state.sessions.authorize_access(&token).await?;
            state
                .custody
                .device_history_for_user(access.session.user_id, device_id)
                .await?
        }
    };

    Ok((
        StatusCode::OK,
        Json(DeviceHistoryResponse::new(device_id, &entries)),
    ))
}
