use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use causerie_shared::{
    KeyBundle, KeyStatus, Message, OneTimePreKey, PreKeyBundle, RoomId, SignedPreKey, UserId,
};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::error::ApiError;
use crate::gateway;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(gateway::ws_handler))
        .route("/rooms/{id}/messages", get(room_history))
        .route("/users/{id}/keys", post(store_key_bundle))
        .route("/users/{id}/keys/status", get(key_status))
        .route("/users/{id}/keys/signed", post(rotate_signed_pre_key))
        .route("/users/{id}/keys/one-time", post(replenish_pre_keys))
        .route("/users/{id}/prekey-bundle", get(pre_key_bundle))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol: &'static str,
    online_users: usize,
    connections: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol: causerie_shared::constants::PROTOCOL_VERSION,
        online_users: state.engine.registry.online_user_count().await,
        connections: state.engine.registry.connection_count().await,
    })
}

// ─── Message history ───

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    user_id: Uuid,
    #[serde(default = "default_history_limit")]
    limit: u32,
    #[serde(default)]
    before: Option<DateTime<Utc>>,
}

fn default_history_limit() -> u32 {
    50
}

/// Live history for a room member, newest first.
async fn room_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let messages = state
        .engine
        .ledger
        .history(RoomId(id), UserId(query.user_id), query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

// ─── Key distribution ───

async fn store_key_bundle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(bundle): Json<KeyBundle>,
) -> Result<Json<KeyStatus>, ApiError> {
    let status = state
        .engine
        .e2e
        .store_initial_key_bundle(UserId(id), bundle)
        .await?;
    Ok(Json(status))
}

async fn key_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<KeyStatus>, ApiError> {
    let status = state.engine.e2e.key_status(UserId(id)).await?;
    Ok(Json(status))
}

async fn rotate_signed_pre_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(signed): Json<SignedPreKey>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.engine.e2e.rotate_signed_pre_key(UserId(id), signed).await?;
    Ok(Json(serde_json::json!({ "rotated": true })))
}

async fn replenish_pre_keys(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(keys): Json<Vec<OneTimePreKey>>,
) -> Result<Json<KeyStatus>, ApiError> {
    let status = state.engine.e2e.replenish_pre_keys(UserId(id), keys).await?;
    Ok(Json(status))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreKeyBundleQuery {
    requester: Uuid,
}

/// Fetch a session-initiation bundle for the target user, consuming one of
/// their one-time pre-keys.
async fn pre_key_bundle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PreKeyBundleQuery>,
) -> Result<Json<PreKeyBundle>, ApiError> {
    let bundle = state
        .engine
        .e2e
        .get_pre_key_bundle_for(UserId(query.requester), UserId(id))
        .await?;
    Ok(Json(bundle))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP/WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
