//! Admin REST API: CRUD over routes and trunks, call-log access, and a
//! health endpoint.
//!
//! Requests authenticate with `X-Account-ID` + `X-API-Key` headers validated
//! against the accounts table. Route mutations invalidate the route cache.
//! Outbound call initiation is exposed but not implemented.

use axum::extract::{Path, Query, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{extract::FromRequestParts, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use crate::cache::Cache;
use crate::db::PgStore;
use crate::models::{CallLog, Route, Trunk};
use crate::registry::SessionRegistry;

/// Shared state for the admin API
pub struct ApiState {
    pub store: PgStore,
    pub cache: Option<Arc<Cache>>,
    pub registry: Arc<SessionRegistry>,
    pub auth_enabled: bool,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found"),
            ApiError::Database(e) => {
                error!("database error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Authenticated account scope extracted from request headers
pub struct AuthedAccount {
    pub account_id: Uuid,
}

impl FromRequestParts<Arc<ApiState>> for AuthedAccount {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let account_id = parts
            .headers
            .get("X-Account-ID")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Uuid>().ok())
            .ok_or(ApiError::Unauthorized)?;

        if !state.auth_enabled {
            return Ok(Self { account_id });
        }

        let api_key = parts
            .headers
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        match state.store.validate_api_key(account_id, api_key).await? {
            Some(_) => Ok(Self { account_id }),
            None => Err(ApiError::Unauthorized),
        }
    }
}

/// Build the admin router
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/routes", get(list_routes).post(create_route))
        .route(
            "/api/v1/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/api/v1/trunks", get(list_trunks).post(create_trunk))
        .route(
            "/api/v1/trunks/{id}",
            get(get_trunk).put(update_trunk).delete(delete_trunk),
        )
        .route("/api/v1/calls", get(list_calls).post(initiate_call))
        .route("/api/v1/calls/{id}", get(get_call))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_calls: usize,
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_calls: state.registry.active_count().await,
    })
}

// ===== Routes =====

#[derive(Debug, Deserialize)]
struct RoutePayload {
    name: String,
    #[serde(default)]
    priority: i32,
    match_to_user: Option<String>,
    match_from_user: Option<String>,
    match_sip_header: Option<String>,
    match_sip_header_value: Option<String>,
    websocket_url: String,
    #[serde(default = "empty_object")]
    custom_data: serde_json::Value,
    #[serde(default = "default_true")]
    active: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_true() -> bool {
    true
}

async fn invalidate_route_cache(state: &ApiState) {
    if let Some(cache) = &state.cache {
        if let Err(e) = cache.invalidate_routes().await {
            warn!("route cache invalidation failed: {e}");
        }
    }
}

async fn list_routes(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
) -> Result<Json<Vec<Route>>, ApiError> {
    Ok(Json(state.store.list_routes(auth.account_id).await?))
}

async fn get_route(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<Route>, ApiError> {
    state
        .store
        .get_route(auth.account_id, id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn create_route(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Json(payload): Json<RoutePayload>,
) -> Result<(StatusCode, Json<Route>), ApiError> {
    let route = state
        .store
        .create_route(
            auth.account_id,
            &payload.name,
            payload.priority,
            payload.match_to_user.as_deref(),
            payload.match_from_user.as_deref(),
            payload.match_sip_header.as_deref(),
            payload.match_sip_header_value.as_deref(),
            &payload.websocket_url,
            payload.custom_data,
        )
        .await?;

    invalidate_route_cache(&state).await;
    Ok((StatusCode::CREATED, Json(route)))
}

async fn update_route(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
    Json(payload): Json<RoutePayload>,
) -> Result<Json<Route>, ApiError> {
    let route = state
        .store
        .update_route(
            auth.account_id,
            id,
            &payload.name,
            payload.priority,
            payload.match_to_user.as_deref(),
            payload.match_from_user.as_deref(),
            payload.match_sip_header.as_deref(),
            payload.match_sip_header_value.as_deref(),
            &payload.websocket_url,
            payload.custom_data,
            payload.active,
        )
        .await?
        .ok_or(ApiError::NotFound)?;

    invalidate_route_cache(&state).await;
    Ok(Json(route))
}

async fn delete_route(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_route(auth.account_id, id).await? {
        return Err(ApiError::NotFound);
    }
    invalidate_route_cache(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

// ===== Trunks =====

#[derive(Debug, Deserialize)]
struct TrunkPayload {
    name: String,
    host: String,
    #[serde(default = "default_sip_port")]
    port: i32,
    #[serde(default = "default_transport")]
    transport: String,
    username: Option<String>,
    password: Option<String>,
    from_user: Option<String>,
    from_host: Option<String>,
    #[serde(default)]
    register: bool,
    #[serde(default = "default_register_interval")]
    register_interval: i32,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_sip_port() -> i32 {
    5060
}

fn default_transport() -> String {
    "udp".to_string()
}

fn default_register_interval() -> i32 {
    3600
}

async fn list_trunks(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
) -> Result<Json<Vec<Trunk>>, ApiError> {
    Ok(Json(state.store.list_trunks(auth.account_id).await?))
}

async fn get_trunk(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<Trunk>, ApiError> {
    state
        .store
        .get_trunk(auth.account_id, id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn create_trunk(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Json(payload): Json<TrunkPayload>,
) -> Result<(StatusCode, Json<Trunk>), ApiError> {
    let trunk = state
        .store
        .create_trunk(
            auth.account_id,
            &payload.name,
            &payload.host,
            payload.port,
            &payload.transport,
            payload.username.as_deref(),
            payload.password.as_deref(),
            payload.from_user.as_deref(),
            payload.from_host.as_deref(),
            payload.register,
            payload.register_interval,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(trunk)))
}

async fn update_trunk(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
    Json(payload): Json<TrunkPayload>,
) -> Result<Json<Trunk>, ApiError> {
    state
        .store
        .update_trunk(
            auth.account_id,
            id,
            &payload.name,
            &payload.host,
            payload.port,
            &payload.transport,
            payload.username.as_deref(),
            payload.password.as_deref(),
            payload.from_user.as_deref(),
            payload.from_host.as_deref(),
            payload.register,
            payload.register_interval,
            payload.active,
        )
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn delete_trunk(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.store.delete_trunk(auth.account_id, id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

// ===== Calls =====

#[derive(Debug, Deserialize)]
struct ListCallsParams {
    limit: Option<i64>,
}

async fn list_calls(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Query(params): Query<ListCallsParams>,
) -> Result<Json<Vec<CallLog>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_calls(auth.account_id, params.limit.unwrap_or(100))
            .await?,
    ))
}

async fn get_call(
    State(state): State<Arc<ApiState>>,
    auth: AuthedAccount,
    Path(id): Path<Uuid>,
) -> Result<Json<CallLog>, ApiError> {
    state
        .store
        .get_call(auth.account_id, id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn initiate_call(auth: AuthedAccount) -> (StatusCode, Json<serde_json::Value>) {
    let _ = auth;
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({ "error": "outbound call initiation is not implemented" })),
    )
}
