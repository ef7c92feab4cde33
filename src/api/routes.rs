use super::ApiState;
use crate::catalog::CatalogError;
use crate::models::{Item, UserPrefs};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/items", post(add_item).get(list_items))
        .route("/items/:item_id", delete(remove_item))
        .route("/items/:item_id/check", post(check_item_now))
        .route("/users/:user_id/prefs", put(set_prefs))
        .route("/admin/items", get(admin_list))
        .route("/admin/ban", post(admin_ban))
        .route("/admin/items/:item_id/enabled", post(admin_set_enabled))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Discrete error payload for the bot to phrase an answer from.
struct ApiError(CatalogError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, extra) = match &self.0 {
            CatalogError::InvalidUrl(_) | CatalogError::InvalidInput(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_input", None)
            }
            CatalogError::DuplicateUrl => (StatusCode::CONFLICT, "duplicate_url", None),
            CatalogError::QuotaExceeded { reset_at } => (
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exceeded",
                Some(json!({ "reset_at": reset_at.to_rfc3339() })),
            ),
            CatalogError::Banned => (StatusCode::FORBIDDEN, "banned", None),
            CatalogError::NotFound => (StatusCode::NOT_FOUND, "not_found", None),
            CatalogError::NotOwner => (StatusCode::FORBIDDEN, "not_owner", None),
            CatalogError::NotAdmin => (StatusCode::FORBIDDEN, "not_admin", None),
            CatalogError::Engine(e) => {
                error!(error = %e, "API request hit engine error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        };
        let mut body = json!({ "error": code, "message": self.0.to_string() });
        if let Some(serde_json::Value::Object(extra)) = extra {
            for (k, v) in extra {
                body[k.as_str()] = v;
            }
        }
        (status, Json(body)).into_response()
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        Self(e)
    }
}

async fn health(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let items = state.store.item_count().await.map_err(CatalogError::Engine)?;
    let history = state
        .store
        .history_count()
        .await
        .map_err(CatalogError::Engine)?;
    Ok(Json(json!({
        "status": "ok",
        "items": items,
        "check_records": history,
    })))
}

#[derive(Debug, Deserialize)]
struct AddItemRequest {
    user_id: String,
    name: String,
    url: String,
    #[serde(default)]
    config_text: String,
}

async fn add_item(
    State(state): State<ApiState>,
    Json(req): Json<AddItemRequest>,
) -> Result<Json<Item>, ApiError> {
    let item = state
        .service
        .add_item(&req.user_id, &req.name, &req.url, &req.config_text)
        .await?;
    Ok(Json(item))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
    #[serde(default)]
    page: u32,
    #[serde(default = "default_page_size")]
    size: u32,
}

fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Serialize)]
struct ItemsResponse {
    items: Vec<Item>,
    page: u32,
}

async fn list_items(
    State(state): State<ApiState>,
    Query(q): Query<UserQuery>,
) -> Result<Json<ItemsResponse>, ApiError> {
    let items = state.service.list_items(&q.user_id, q.page, q.size).await?;
    Ok(Json(ItemsResponse {
        items,
        page: q.page,
    }))
}

#[derive(Debug, Deserialize)]
struct ActorQuery {
    user_id: String,
}

async fn remove_item(
    State(state): State<ApiState>,
    Path(item_id): Path<String>,
    Query(q): Query<ActorQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.service.remove_item(&q.user_id, &item_id).await?;
    Ok(Json(json!({ "removed": item_id })))
}

/// Diagnostic one-shot poll, outside the regular schedule.
async fn check_item_now(
    State(state): State<ApiState>,
    Path(item_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.oneshot.check_now(&item_id).await {
        Ok(Some(record)) => Ok(Json(json!({
            "item_id": record.item_id,
            "verdict": record.verdict.as_str(),
            "confidence": record.confidence,
            "http_status": record.http_status,
            "latency_ms": record.latency_ms,
        }))),
        Ok(None) => Err(CatalogError::NotFound.into()),
        Err(e) => Err(CatalogError::Engine(e).into()),
    }
}

#[derive(Debug, Deserialize)]
struct PrefsRequest {
    cooldown_seconds: Option<u64>,
    daily_notify_limit: Option<u32>,
    /// [start, end] hours; null clears the window.
    #[serde(default, with = "quiet_hours_opt")]
    quiet_hours: Option<Option<(u8, u8)>>,
    notifications_enabled: Option<bool>,
}

/// Accepts `"quiet_hours": [23, 7]` or `"quiet_hours": null`; absence
/// leaves the setting untouched.
mod quiet_hours_opt {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Option<(u8, u8)>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v: Option<[u8; 2]> = Option::deserialize(d)?;
        Ok(Some(v.map(|[a, b]| (a, b))))
    }
}

async fn set_prefs(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Json(req): Json<PrefsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let prefs = UserPrefs {
        cooldown_seconds: req.cooldown_seconds,
        daily_notify_limit: req.daily_notify_limit,
        quiet_hours: req.quiet_hours,
        notifications_enabled: req.notifications_enabled,
    };
    let user = state.service.set_user_prefs(&user_id, &prefs).await?;
    Ok(Json(json!({
        "user_id": user.user_id,
        "cooldown_seconds": user.cooldown_seconds,
        "daily_notify_limit": user.daily_notify_limit,
        "quiet_hours": user.quiet_start.zip(user.quiet_end),
        "notifications_enabled": user.notifications_enabled,
    })))
}

#[derive(Debug, Deserialize)]
struct AdminListQuery {
    admin_id: String,
    filter: Option<String>,
}

async fn admin_list(
    State(state): State<ApiState>,
    Query(q): Query<AdminListQuery>,
) -> Result<Json<Vec<Item>>, ApiError> {
    let items = state
        .service
        .admin_list_all(&q.admin_id, q.filter.as_deref())
        .await?;
    Ok(Json(items))
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    admin_id: String,
    user_id: String,
    #[serde(default = "default_true")]
    banned: bool,
}

fn default_true() -> bool {
    true
}

async fn admin_ban(
    State(state): State<ApiState>,
    Json(req): Json<BanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .service
        .admin_ban(&req.admin_id, &req.user_id, req.banned)
        .await?;
    Ok(Json(json!({ "user_id": req.user_id, "banned": req.banned })))
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    admin_id: String,
    enabled: bool,
}

async fn admin_set_enabled(
    State(state): State<ApiState>,
    Path(item_id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .service
        .admin_set_item_enabled(&req.admin_id, &item_id, req.enabled)
        .await?;
    Ok(Json(json!({ "item_id": item_id, "enabled": req.enabled })))
}
