use axum::extract::State;
use axum::http::StatusCode;
use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::error;

use crate::error::EngineError;
use crate::geo::{MIN_DISTANCE_CHOICES, MIN_PUBLISH_INTERVAL_CHOICES, POLL_INTERVAL_CHOICES};
use crate::scheduler::EngineHandle;
use crate::types::*;

pub fn router(engine: EngineHandle) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/sharing/start", post(start_sharing))
        .route("/api/sharing/stop", post(stop_sharing))
        .route("/api/locate", post(locate))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/config/options", get(config_options))
        .route("/api/peers", get(list_peers))
        .route("/api/subscription/restart", post(restart_subscription))
        .with_state(engine)
}

// ---------- API HANDLERS ---------- //

async fn status(State(engine): State<EngineHandle>) -> Json<EngineStatus> {
    Json(engine.status())
}

async fn start_sharing(
    State(engine): State<EngineHandle>,
) -> Result<Json<Value>, (StatusCode, String)> {
    engine.start_sharing().await.map_err(engine_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn stop_sharing(
    State(engine): State<EngineHandle>,
) -> Result<Json<Value>, (StatusCode, String)> {
    engine.stop_sharing().await.map_err(engine_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn locate(State(engine): State<EngineHandle>) -> Result<Json<Value>, (StatusCode, String)> {
    engine.locate().await.map_err(engine_error)?;
    Ok(Json(json!({"ok": true})))
}

async fn get_config(State(engine): State<EngineHandle>) -> Json<ConfigRes> {
    let status = engine.status();
    Json(ConfigRes {
        display_name: status.display_name,
        throttle: status.config,
    })
}

async fn put_config(
    State(engine): State<EngineHandle>,
    Json(req): Json<ConfigReq>,
) -> Result<Json<ConfigRes>, (StatusCode, String)> {
    // merged against the engine's own settings, not a status snapshot
    let applied = engine.apply_config(req).await.map_err(engine_error)?;
    Ok(Json(applied))
}

async fn config_options() -> Json<Value> {
    Json(json!({
        "poll_interval_secs": POLL_INTERVAL_CHOICES,
        "min_distance_m": MIN_DISTANCE_CHOICES,
        "min_publish_interval_secs": MIN_PUBLISH_INTERVAL_CHOICES,
    }))
}

async fn list_peers(State(engine): State<EngineHandle>) -> Json<Value> {
    let peers = engine.peers();
    let now = Utc::now();
    let visible: Vec<PeerRes> = peers
        .visible(engine.device_id())
        .into_iter()
        .map(|p| PeerRes {
            device_id: p.device_id.clone(),
            display_name: p.display_name.clone(),
            latitude: p.position.latitude,
            longitude: p.position.longitude,
            last_seen: p.last_seen,
            mins_ago: p.minutes_ago(now),
        })
        .collect();

    Json(json!({
        "sharing_devices": peers.len(),
        "refreshed_at": peers.refreshed_at(),
        "peers": visible,
    }))
}

async fn restart_subscription(
    State(engine): State<EngineHandle>,
) -> Result<Json<Value>, (StatusCode, String)> {
    engine.resubscribe().await.map_err(engine_error)?;
    Ok(Json(json!({"ok": true})))
}

fn badreq<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, e.to_string())
}
fn engine_error(e: EngineError) -> (StatusCode, String) {
    match e {
        EngineError::Config(e) => badreq(e),
        EngineError::Stopped => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        EngineError::Identity(e) => {
            error!("{e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal".into())
        }
    }
}
