//! Bot-facing API tests: the JSON surface and its discrete error codes,
//! driven through the router without a socket.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tower::ServiceExt;

use stockbot_backend::{
    api::{ApiState, OneShotCheck},
    config::Config,
    models::CheckRecord,
    service::MonitorService,
    store::Store,
};

struct NoOneShot;

#[async_trait::async_trait]
impl OneShotCheck for NoOneShot {
    async fn check_now(&self, _item_id: &str) -> anyhow::Result<Option<CheckRecord>> {
        Ok(None)
    }
}

fn router() -> Router {
    let store = Store::open_in_memory().unwrap();
    let config = Arc::new(Config {
        admin_ids: vec!["admin".into()],
        daily_add_limit: 2,
        ..Config::default()
    });
    let service = MonitorService::new(store.clone(), config);
    stockbot_backend::api::routes::router(ApiState {
        service,
        store,
        oneshot: Arc::new(NoOneShot),
    })
}

async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn add_list_remove_roundtrip() {
    let app = router();

    let (status, item) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({
            "user_id": "u1",
            "name": "KVM 512",
            "url": "https://example.com/vps?utm_source=tg",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // Canonicalised on the way in.
    assert_eq!(item["url"], "https://example.com/vps");
    let item_id = item["item_id"].as_str().unwrap().to_string();

    let (status, body) = get(&app, "/items?user_id=u1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    let (status, _) = send_json(
        &app,
        "DELETE",
        &format!("/items/{}?user_id=u1", item_id),
        serde_json::Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = get(&app, "/items?user_id=u1").await;
    assert!(body["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn discrete_error_codes() {
    let app = router();

    // Garbage URL.
    let (status, body) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u1", "name": "x", "url": "not a url"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_input");

    // Duplicate through a tracking-param variant.
    for _ in 0..1 {
        send_json(
            &app,
            "POST",
            "/items",
            serde_json::json!({"user_id": "u1", "name": "a", "url": "https://example.com/a"}),
        )
        .await;
    }
    let (status, body) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u2", "name": "a", "url": "https://example.com/a/?utm_x=1"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "duplicate_url");

    // Quota (limit is 2; one slot used above).
    send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u1", "name": "b", "url": "https://example.com/b"}),
    )
    .await;
    let (status, body) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u1", "name": "c", "url": "https://example.com/c"}),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "quota_exceeded");
    assert!(body["reset_at"].is_string());

    // Admin surface closed to regular users.
    let (status, body) = get(&app, "/admin/items?admin_id=u1").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "not_admin");

    // One-shot check of an unknown item.
    let (status, body) = send_json(
        &app,
        "POST",
        "/items/nope/check",
        serde_json::Value::Null,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn admin_ban_and_disable_flow() {
    let app = router();

    let (_, item) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u1", "name": "a", "url": "https://example.com/a"}),
    )
    .await;
    let item_id = item["item_id"].as_str().unwrap();

    let (status, _) = send_json(
        &app,
        "POST",
        &format!("/admin/items/{}/enabled", item_id),
        serde_json::json!({"admin_id": "admin", "enabled": false}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, items) = get(&app, "/admin/items?admin_id=admin").await;
    assert_eq!(items[0]["enabled"], false);

    let (status, _) = send_json(
        &app,
        "POST",
        "/admin/ban",
        serde_json::json!({"admin_id": "admin", "user_id": "u1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(
        &app,
        "POST",
        "/items",
        serde_json::json!({"user_id": "u1", "name": "b", "url": "https://example.com/b"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "banned");
}

#[tokio::test]
async fn prefs_update_and_validation() {
    let app = router();

    let (status, body) = send_json(
        &app,
        "PUT",
        "/users/u1/prefs",
        serde_json::json!({"cooldown_seconds": 1200, "quiet_hours": [23, 7]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cooldown_seconds"], 1200);
    assert_eq!(body["quiet_hours"], serde_json::json!([23, 7]));

    let (status, body) = send_json(
        &app,
        "PUT",
        "/users/u1/prefs",
        serde_json::json!({"quiet_hours": [25, 7]}),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn health_reports_counts() {
    let app = router();
    let (status, body) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["items"], 0);
}
