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
        auth::{MessageResponse, RefreshRequest, SessionValidationResponse, TokenResponse},
        ErrorResponse,
    },
    handlers::context::BearerToken,
    services::SessionError,
    utils::ValidatedJson,
    AppState,
};

/// Rotate a session's refresh counter and issue a new token pair
#[utoipa::path(
    post,
    path = "/api/v1/auth/session/refresh/{session_id}",
    params(("session_id" = Uuid, Path, description = "Session being refreshed")),
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Session refreshed", body = TokenResponse),
        (status = 400, description = "Session ID does not match token", body = ErrorResponse),
        (status = 401, description = "Invalid, stale or expired token", body = ErrorResponse)
    ),
    tag = "Sessions"
)]
pub async fn refresh_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<RefreshRequest>,
) -> Result<impl IntoResponse, AppError> {
    let (_, tokens) = state
        .sessions
        .refresh_session(&req.refresh_token, Some(session_id))
        .await?;
    Ok((StatusCode::OK, Json(TokenResponse::from(tokens))))
}

/// Validate a bearer access token against its live session
#[utoipa::path(
    get,
    path = "/api/v1/auth/session/validate",
    responses(
        (status = 200, description = "Token accepted", body = SessionValidationResponse),
        (status = 401, description = "Invalid, stale or expired token", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn validate_session(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let access = state.sessions.authorize_access(&token).await?;
    Ok((
        StatusCode::OK,
        Json(SessionValidationResponse::new(&access.claims, &access.session)),
    ))
}

/// Invalidate the session the bearer token belongs to
#[utoipa::path(
    post,
    path = "/api/v1/auth/session/{session_id}/invalidate",
    params(("session_id" = Uuid, Path, description = "Session to invalidate")),
    responses(
        (status = 200, description = "Session invalidated", body = MessageResponse),
        (status = 400, description = "Session ID does not match token", body = ErrorResponse),
        (status = 401, description = "Invalid, stale or expired token", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn invalidate_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    BearerToken(token): BearerToken,
) -> Result<impl IntoResponse, AppError> {
    let access = state.sessions.authorize_access(&token).await?;
    if access.claims.sid != session_id {
        return Err(SessionError::SessionMismatch.into());
    }

    state.sessions.invalidate_session(session_id).await?;
    Ok((
        StatusCode::OK,
        Json(MessageResponse {
            message: "Session invalidated".to_string(),
        }),
    ))
}
