//! HTTP surface: routing, status codes, extractors and middleware.

mod common;

use common::{otp_for, TestContext};
use device_auth_service::build_router;
use serde_json::{json, Value};
use service_core::axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use tower::util::ServiceExt;

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn health_reports_both_backends() {
    let ctx = TestContext::new();
    let app = build_router(ctx.app_state());

    let response = app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert!(response.headers().contains_key("x-request-id"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["redis"], "up");
}

#[tokio::test]
async fn caller_request_id_is_echoed() {
    let ctx = TestContext::new();
    let app = build_router(ctx.app_state());

    let response = app
        .oneshot(
            Request::get("/health")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "req-42");
}

#[tokio::test]
async fn device_authentication_returns_user_and_device() {
    let ctx = TestContext::new();
    let user = ctx.user_with("alice", &[("doors", "open")]).await;
    let (device, public_id) = ctx.yubikey_for(Some(user.user_id)).await;
    let app = build_router(ctx.app_state());

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/device",
            json!({
                "device_type": "yubikey",
                "auth_code": otp_for(&public_id),
                "permission": "doors:open"
            }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["authenticated"], true);
    assert_eq!(body["user"]["user_id"], user.user_id.to_string());
    assert_eq!(body["device"]["device_id"], device.device_id.to_string());
    assert_eq!(body["permissions_checked"], json!(["doors:open"]));
}

#[tokio::test]
async fn authentication_failures_map_to_statuses() {
    let ctx = TestContext::new();
    let user = ctx.user_with("bob", &[]).await;
    let (_, public_id) = ctx.yubikey_for(Some(user.user_id)).await;
    let app = build_router(ctx.app_state());
    let otp = otp_for(&public_id);

    let request = |code: &str, permission: Option<&str>| {
        json_request(
            Method::POST,
            "/api/v1/auth/device",
            json!({ "device_type": "yubikey", "auth_code": code, "permission": permission }),
        )
    };

    let (status, body) = send(&app, request(&otp, Some("vault:open"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());

    // Same OTP again: the authority reports a replay.
    let (status, _) = send(&app, request(&otp, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, request("cccc", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/device",
            json!({ "device_type": "smartcard", "auth_code": "123456" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/device",
            json!({ "device_type": "", "auth_code": "" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let ctx = TestContext::new();
    let user = ctx.user_with("carol", &[]).await;
    let (_, public_id) = ctx.yubikey_for(Some(user.user_id)).await;
    let app = build_router(ctx.app_state());

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/session",
            json!({ "device_type": "yubikey", "auth_code": otp_for(&public_id) }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 900);
    let session_id = body["session_id"].as_str().unwrap().to_string();
    let access = body["access_token"].as_str().unwrap().to_string();
    let refresh = body["refresh_token"].as_str().unwrap().to_string();

    let validate = |token: &str| {
        Request::get("/api/v1/auth/session/validate")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&app, validate(&access)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);
    assert_eq!(body["access_count"], 1);

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            &format!("/api/v1/auth/session/refresh/{}", session_id),
            json!({ "refresh_token": refresh }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_access = body["access_token"].as_str().unwrap().to_string();

    let (status, _) = send(&app, validate(&access)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Request::post(format!(
            "/api/v1/auth/session/{}/invalidate",
            uuid::Uuid::new_v4()
        ))
        .header(header::AUTHORIZATION, format!("Bearer {}", new_access))
        .body(Body::empty())
        .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Request::post(format!("/api/v1/auth/session/{}/invalidate", session_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", new_access))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Session invalidated");

    let (status, _) = send(&app, validate(&new_access)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_bearer_token_is_unauthorized() {
    let ctx = TestContext::new();
    let app = build_router(ctx.app_state());

    let (status, _) = send(
        &app,
        Request::get("/api/v1/auth/session/validate")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn custody_routes_use_the_authorization_credential() {
    let ctx = TestContext::new();
    let (_, custodian_key) = ctx.custodian().await;
    let target = ctx.user_with("dana", &[]).await;
    let app = build_router(ctx.app_state());
    let credential = |key: &str| format!("yubikey:{}", otp_for(key));

    let new_key = common::public_id();
    let mut request = json_request(
        Method::POST,
        "/api/v1/devices/register",
        json!({
            "user_email": target.email,
            "device_type": "yubikey",
            "device_identifier": new_key,
            "notes": "issued at onboarding"
        }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        credential(&custodian_key).parse().unwrap(),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["owner_user_id"], target.user_id.to_string());
    let device_id = body["device"]["device_id"].as_str().unwrap().to_string();

    // Neither or both target fields.
    let mut request = json_request(
        Method::POST,
        "/api/v1/devices/register",
        json!({ "device_type": "yubikey", "device_identifier": common::public_id() }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        credential(&custodian_key).parse().unwrap(),
    );
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut request = json_request(
        Method::POST,
        &format!("/api/v1/devices/deregister/{}", device_id),
        json!({ "reason": "stolen" }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        credential(&custodian_key).parse().unwrap(),
    );
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut request = json_request(
        Method::POST,
        &format!("/api/v1/devices/deregister/{}", device_id),
        json!({ "reason": "user_left" }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        credential(&custodian_key).parse().unwrap(),
    );
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["owner_user_id"], Value::Null);

    let (status, body) = send(
        &app,
        Request::get(format!("/api/v1/devices/history/{}", device_id))
            .header(header::AUTHORIZATION, credential(&custodian_key))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body["history"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action_type"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["deregister", "register"]);
    assert_eq!(body["history"][1]["notes"], "issued at onboarding");
}

#[tokio::test]
async fn custody_route_rejects_bearer_credentials_for_mutations() {
    let ctx = TestContext::new();
    let app = build_router(ctx.app_state());

    let mut request = json_request(
        Method::POST,
        "/api/v1/devices/register",
        json!({
            "user_id": uuid::Uuid::new_v4(),
            "device_type": "yubikey",
            "device_identifier": common::public_id()
        }),
    );
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer not-a-device-credential".parse().unwrap(),
    );
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn history_accepts_a_session_token() {
    let ctx = TestContext::new();
    let (custodian, custodian_key) = ctx.custodian().await;
    let app = build_router(ctx.app_state());
    let (device, _) = ctx.yubikey_for(Some(custodian.user_id)).await;

    let (status, body) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/auth/session",
            json!({ "device_type": "yubikey", "auth_code": otp_for(&custodian_key) }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let access = body["access_token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Request::get(format!("/api/v1/devices/history/{}", device.device_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device_id"], device.device_id.to_string());
    assert_eq!(body["history"], json!([]));
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let ctx = TestContext::new();
    let app = build_router(ctx.app_state());

    let (status, body) = send(
        &app,
        Request::get("/.well-known/openapi.json")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/v1/auth/device"].is_object());
    assert!(body["paths"]["/api/v1/devices/history/{device_id}"].is_object());
}
