//! # Integration Tests for the HTTP API
//!
//! Drives the full router built by `NotificationService` with in-memory
//! backends through `tower::ServiceExt::oneshot`.

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use notification_dispatch::config::{CacheBackend, QueueBackend, StoreBackend};
use notification_dispatch::{NotificationConfig, NotificationService};

/// Test configuration with every backend in process
fn create_test_config() -> NotificationConfig {
    let mut config = NotificationConfig::default();
    config.database.backend = StoreBackend::Memory;
    config.queue.backend = QueueBackend::Memory;
    config.preferences.cache_backend = CacheBackend::Memory;
    config.email.enabled = false;
    config
}

async fn create_app() -> Router {
    NotificationService::new(create_test_config())
        .await
        .unwrap()
        .router()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn email_request() -> Value {
    json!({
        "user_id": "u1",
        "channel": "email",
        "recipient": "a@b.com",
        "subject": "Welcome",
        "body": "hi",
        "metadata": {"campaign": "spring"}
    })
}

#[tokio::test]
async fn test_create_then_get() {
    let app = create_app().await;

    let (status, created) = send(
        &app,
        Method::POST,
        "/api/v1/notifications",
        Some(email_request()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["message"], "Notification created successfully");

    let id = created["id"].as_str().unwrap();
    let (status, fetched) = send(
        &app,
        Method::GET,
        &format!("/api/v1/notifications/{}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);
    assert_eq!(fetched["channel"], "email");
    assert_eq!(fetched["priority"], 2);
    assert_eq!(fetched["metadata"]["campaign"], "spring");
}

#[tokio::test]
async fn test_validation_errors_use_error_envelope() {
    let app = create_app().await;
    let mut request = email_request();
    request["channel"] = json!("pigeon");

    let (status, body) = send(&app, Method::POST, "/api/v1/notifications", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert_eq!(body["error"]["status"], 400);
}

#[tokio::test]
async fn test_malformed_bodies_use_error_envelope() {
    let app = create_app().await;

    let mut missing_body = email_request();
    missing_body.as_object_mut().unwrap().remove("body");
    let (status, body) = send(&app, Method::POST, "/api/v1/notifications", Some(missing_body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    assert!(body["error"]["message"].as_str().unwrap().contains("body"));

    let mut wrong_type = email_request();
    wrong_type["priority"] = json!("urgent");
    let (status, body) = send(&app, Method::POST, "/api/v1/notifications", Some(wrong_type)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, body) = send(
        &app,
        Method::PUT,
        "/api/v1/users/u1/preferences/email",
        Some(json!({"frequency": "daily"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/v1/notifications")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing was stored by any of the rejected requests.
    let (_, listed) = send(&app, Method::GET, "/api/v1/notifications?user_id=u1", None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_disabled_preference_is_unprocessable() {
    let app = create_app().await;

    let (status, preference) = send(
        &app,
        Method::PUT,
        "/api/v1/users/u1/preferences/email",
        Some(json!({"enabled": false, "frequency": "daily"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(preference["enabled"], false);
    assert_eq!(preference["frequency"], "daily");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/v1/notifications",
        Some(email_request()),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "PREFERENCE_DENIED");

    let (_, listed) = send(&app, Method::GET, "/api/v1/notifications?user_id=u1", None).await;
    assert_eq!(listed, json!([]));
}

#[tokio::test]
async fn test_status_update_and_listing() {
    let app = create_app().await;
    let (_, created) = send(
        &app,
        Method::POST,
        "/api/v1/notifications",
        Some(email_request()),
    )
    .await;
    let id = created["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/api/v1/notifications/{}/status", id),
        Some(json!({"status": "delivered", "external_id": "ext-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true}));

    let (status, listed) = send(
        &app,
        Method::GET,
        "/api/v1/notifications?user_id=u1&status=delivered",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["external_id"], "ext-1");
    assert!(listed[0]["delivered_at"].is_string());

    let (status, body) = send(
        &app,
        Method::PUT,
        &format!("/api/v1/notifications/{}/status", id),
        Some(json!({"status": "bounced"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_cancel_pending_notification() {
    let app = create_app().await;
    let (_, created) = send(
        &app,
        Method::POST,
        "/api/v1/notifications",
        Some(email_request()),
    )
    .await;
    let uri = format!("/api/v1/notifications/{}", created["id"].as_str().unwrap());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, fetched) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(fetched["status"], "cancelled");

    let (status, body) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_unknown_ids_are_not_found() {
    let app = create_app().await;

    for uri in [
        "/api/v1/notifications/00000000-0000-0000-0000-000000000000",
        "/api/v1/notifications/garbage",
    ] {
        let (status, body) = send(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_counters() {
    let app = create_app().await;
    send(
        &app,
        Method::POST,
        "/api/v1/notifications",
        Some(email_request()),
    )
    .await;

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("notifications_created_total{channel=\"email\"} 1"));
}

#[tokio::test]
async fn test_health_reports_store() {
    let app = create_app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["store"]["status"], "healthy");
}
