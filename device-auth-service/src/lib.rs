pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Json, Router,
};
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::{request_id_middleware, RequestId, REQUEST_ID_HEADER},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::DeviceAuthConfig;
use crate::services::{
    Authenticator, CredentialVerifier, CustodyLedger, IdentityStore, JwtService, OtpAuthority,
    PermissionResolver, SessionManager, SessionStore,
};
use service_core::error::AppError;
use std::sync::Arc;

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::authenticate_device,
        handlers::auth::create_session,
        handlers::sessions::refresh_session,
        handlers::sessions::validate_session,
        handlers::sessions::invalidate_session,
        handlers::devices::register_device,
        handlers::devices::deregister_device,
        handlers::devices::transfer_device,
        handlers::devices::device_history,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::DeviceAuthRequest,
            dtos::auth::DeviceAuthResponse,
            dtos::auth::AuthenticatedUser,
            dtos::auth::DeviceSummary,
            dtos::auth::TokenResponse,
            dtos::auth::SessionResponse,
            dtos::auth::RefreshRequest,
            dtos::auth::SessionValidationResponse,
            dtos::auth::MessageResponse,
            dtos::devices::RegisterDeviceRequest,
            dtos::devices::DeregisterDeviceRequest,
            dtos::devices::TransferDeviceRequest,
            dtos::devices::RegistrationRecord,
            dtos::devices::CustodyResponse,
            dtos::devices::HistoryUser,
            dtos::devices::HistoryEntryResponse,
            dtos::devices::DeviceHistoryResponse,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Hardware token authentication and permission checks"),
        (name = "Sessions", description = "Bearer session lifecycle"),
        (name = "Devices", description = "Device custody ledger"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            // `Authorization: <device_type>:<code>`
            components.add_security_scheme(
                "device_credential",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("authorization"))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: DeviceAuthConfig,
    pub store: Arc<dyn IdentityStore>,
    pub session_store: Arc<dyn SessionStore>,
    pub authenticator: Authenticator,
    pub sessions: SessionManager,
    pub custody: CustodyLedger,
    pub auth_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wire the service graph on top of the given adapters.
    pub fn new(
        config: DeviceAuthConfig,
        store: Arc<dyn IdentityStore>,
        session_store: Arc<dyn SessionStore>,
        otp_authority: Arc<dyn OtpAuthority>,
    ) -> Result<Self, anyhow::Error> {
        let jwt = JwtService::new(&config.jwt)?;
        let authenticator = Authenticator::new(
            store.clone(),
            CredentialVerifier::new(otp_authority),
            PermissionResolver::new(config.authorization.deny_overrides),
        );
        let sessions = SessionManager::new(session_store.clone(), jwt);
        let custody = CustodyLedger::new(authenticator.clone(), store.clone());

        let auth_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.auth_attempts,
            config.rate_limit.auth_window_seconds,
        );
        let ip_rate_limiter = create_ip_rate_limiter(
            config.rate_limit.global_ip_limit,
            config.rate_limit.global_ip_window_seconds,
        );

        Ok(Self {
            config,
            store,
            session_store,
            authenticator,
            sessions,
            custody,
            auth_rate_limiter,
            ip_rate_limiter,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    // Credential-consuming routes share the stricter limiter
    let auth_routes = Router::new()
        .route("/auth/device", post(handlers::auth::authenticate_device))
        .route("/auth/session", post(handlers::auth::create_session))
        .route(
            "/devices/register",
            post(handlers::devices::register_device),
        )
        .route(
            "/devices/deregister/:device_id",
            post(handlers::devices::deregister_device),
        )
        .route(
            "/devices/transfer/:device_id",
            post(handlers::devices::transfer_device),
        )
        .layer(from_fn_with_state(
            state.auth_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ));

    let api = Router::new()
        .merge(auth_routes)
        .route(
            "/auth/session/refresh/:session_id",
            post(handlers::sessions::refresh_session),
        )
        .route(
            "/auth/session/validate",
            get(handlers::sessions::validate_session),
        )
        .route(
            "/auth/session/:session_id/invalidate",
            post(handlers::sessions::invalidate_session),
        )
        .route(
            "/devices/history/:device_id",
            get(handlers::devices::device_history),
        );

    let ip_limiter = state.ip_rate_limiter.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .nest("/api/v1", api)
        .with_state(state.clone())
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .extensions()
                    .get::<RequestId>()
                    .map(RequestId::as_str)
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors_layer(&state.config))
}

fn cors_layer(config: &DeviceAuthConfig) -> CorsLayer {
    use service_core::axum::http::{header, HeaderName, HeaderValue, Method};

    let origins = config
        .security
        .allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "Service is unhealthy")
    ),
    tag = "Observability"
)]
pub async fn health_check(
    service_core::axum::extract::State(state): service_core::axum::extract::State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Database health check failed");
        AppError::ServiceUnavailable("Database unavailable".to_string())
    })?;

    state.session_store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Redis health check failed");
        AppError::ServiceUnavailable("Session store unavailable".to_string())
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "environment": format!("{:?}", state.config.environment),
        "checks": {
            "database": "up",
            "redis": "up"
        }
    })))
}
