//! HTTP route handlers.
//!
//! All handlers are thin: parse the path and body, invoke a backend
//! operation, map the result. Successful mutations answer 202 with an
//! empty body; listing routes answer 200 with `Last-Modified` from the
//! owning cache.

use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{CastellanError, CastellanResult};
use crate::players::{LoopStatus, TransportCommand};
use crate::units::UnitScope;

use super::{stream, AppState};

/// Request bodies are capped at 1 MiB.
const MAX_BODY_BYTES: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let router = Router::new()
        .route("/server", get(get_server))
        .route("/health", get(health_check))
        .route("/events", get(stream::events))
        .route("/players", get(list_players))
        .route("/players/{bus}/seek", post(player_seek))
        .route("/players/{bus}/position", post(player_position))
        .route("/players/{bus}/volume", post(player_volume))
        .route("/players/{bus}/loop", post(player_loop))
        .route("/players/{bus}/shuffle", post(player_shuffle))
        .route("/players/{bus}/{action}", post(player_transport))
        .route("/audio/server", get(get_audio_server))
        .route("/audio/server/mute", post(audio_master_mute))
        .route("/audio/server/volume", post(audio_master_volume))
        .route("/audio/clients", get(list_audio_clients))
        .route("/audio/clients/{sink}/mute", post(audio_client_mute))
        .route("/audio/clients/{sink}/volume", post(audio_client_volume))
        .route("/services", get(list_services))
        .route("/services/{scope}/{unit}/{action}", post(service_action))
        .route("/power", get(get_power))
        .route("/power/reboot", post(power_reboot))
        .route("/power/power_off", post(power_off))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state);

    if cors_origins.is_empty() {
        router
    } else {
        router.layer(cors_layer(cors_origins))
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);
    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(parsed)
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Resolves a backend handle, answering 404 for disabled subsystems.
fn require<'a, T>(backend: &'a Option<Arc<T>>, subsystem: &'static str) -> CastellanResult<&'a Arc<T>> {
    backend
        .as_ref()
        .ok_or(CastellanError::Disabled { subsystem })
}

/// 200 listing response with `Last-Modified` from the owning cache.
fn listing<T: serde::Serialize>(items: &T, updated_at: SystemTime) -> Response {
    (
        [(header::LAST_MODIFIED, crate::utils::http_date(updated_at))],
        Json(items),
    )
        .into_response()
}

const ACCEPTED: StatusCode = StatusCode::ACCEPTED;

// ─────────────────────────────────────────────────────────────────────────────
// Request bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SeekBody {
    /// Relative offset in microseconds.
    offset: i64,
}

#[derive(Deserialize)]
struct PositionBody {
    track_id: String,
    /// Absolute position in microseconds.
    position: i64,
}

#[derive(Deserialize)]
struct VolumeBody {
    volume: f64,
}

#[derive(Deserialize)]
struct LoopBody {
    #[serde(rename = "loop")]
    loop_status: LoopStatus,
}

#[derive(Deserialize)]
struct ShuffleBody {
    shuffle: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Server metadata
// ─────────────────────────────────────────────────────────────────────────────

async fn get_server(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "name": state.server.name,
        "version": state.server.version,
        "os": state.server.os,
        "subsystems": {
            "players": state.players.is_some(),
            "audio": state.audio.is_some(),
            "services": state.units.is_some(),
            "power": state.power.is_some(),
        },
    }))
}

/// Liveness probe: "Is the process running?"
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Players
// ─────────────────────────────────────────────────────────────────────────────

async fn list_players(State(state): State<AppState>) -> CastellanResult<Response> {
    let players = require(&state.players, "mpris")?;
    Ok(listing(&players.list(), players.updated_at()))
}

async fn player_transport(
    State(state): State<AppState>,
    Path((bus, action)): Path<(String, String)>,
) -> CastellanResult<StatusCode> {
    let players = require(&state.players, "mpris")?;
    let Some(command) = TransportCommand::parse(&action) else {
        return Ok(StatusCode::NOT_FOUND);
    };
    players.transport(&bus, command).await?;
    Ok(ACCEPTED)
}

async fn player_seek(
    State(state): State<AppState>,
    Path(bus): Path<String>,
    Json(body): Json<SeekBody>,
) -> CastellanResult<StatusCode> {
    require(&state.players, "mpris")?.seek(&bus, body.offset).await?;
    Ok(ACCEPTED)
}

async fn player_position(
    State(state): State<AppState>,
    Path(bus): Path<String>,
    Json(body): Json<PositionBody>,
) -> CastellanResult<StatusCode> {
    require(&state.players, "mpris")?
        .set_position(&bus, &body.track_id, body.position)
        .await?;
    Ok(ACCEPTED)
}

async fn player_volume(
    State(state): State<AppState>,
    Path(bus): Path<String>,
    Json(body): Json<VolumeBody>,
) -> CastellanResult<StatusCode> {
    require(&state.players, "mpris")?
        .set_volume(&bus, body.volume)
        .await?;
    Ok(ACCEPTED)
}

async fn player_loop(
    State(state): State<AppState>,
    Path(bus): Path<String>,
    Json(body): Json<LoopBody>,
) -> CastellanResult<StatusCode> {
    require(&state.players, "mpris")?
        .set_loop(&bus, body.loop_status)
        .await?;
    Ok(ACCEPTED)
}

async fn player_shuffle(
    State(state): State<AppState>,
    Path(bus): Path<String>,
    Json(body): Json<ShuffleBody>,
) -> CastellanResult<StatusCode> {
    require(&state.players, "mpris")?
        .set_shuffle(&bus, body.shuffle)
        .await?;
    Ok(ACCEPTED)
}

// ─────────────────────────────────────────────────────────────────────────────
// Audio
// ─────────────────────────────────────────────────────────────────────────────

async fn get_audio_server(State(state): State<AppState>) -> CastellanResult<Response> {
    let audio = require(&state.audio, "pulseaudio")?;
    Ok(Json(audio.server_info()?).into_response())
}

async fn audio_master_mute(State(state): State<AppState>) -> CastellanResult<StatusCode> {
    require(&state.audio, "pulseaudio")?.toggle_mute_master().await?;
    Ok(ACCEPTED)
}

async fn audio_master_volume(
    State(state): State<AppState>,
    Json(body): Json<VolumeBody>,
) -> CastellanResult<StatusCode> {
    require(&state.audio, "pulseaudio")?
        .set_volume_master(body.volume)
        .await?;
    Ok(ACCEPTED)
}

async fn list_audio_clients(State(state): State<AppState>) -> CastellanResult<Response> {
    let audio = require(&state.audio, "pulseaudio")?;
    Ok(listing(&audio.list_clients(), audio.updated_at()))
}

async fn audio_client_mute(
    State(state): State<AppState>,
    Path(sink): Path<String>,
) -> CastellanResult<StatusCode> {
    require(&state.audio, "pulseaudio")?.toggle_mute(&sink).await?;
    Ok(ACCEPTED)
}

async fn audio_client_volume(
    State(state): State<AppState>,
    Path(sink): Path<String>,
    Json(body): Json<VolumeBody>,
) -> CastellanResult<StatusCode> {
    require(&state.audio, "pulseaudio")?
        .set_volume(&sink, body.volume)
        .await?;
    Ok(ACCEPTED)
}

// ─────────────────────────────────────────────────────────────────────────────
// Services
// ─────────────────────────────────────────────────────────────────────────────

async fn list_services(State(state): State<AppState>) -> CastellanResult<Response> {
    let units = require(&state.units, "systemd")?;
    Ok(listing(&units.list(), units.updated_at()))
}

async fn service_action(
    State(state): State<AppState>,
    Path((scope, unit, action)): Path<(String, String, String)>,
) -> CastellanResult<StatusCode> {
    let units = require(&state.units, "systemd")?;
    let Some(scope) = UnitScope::parse(&scope) else {
        return Ok(StatusCode::NOT_FOUND);
    };
    match action.as_str() {
        "start" => units.start_service(&unit, scope).await?,
        "stop" => units.stop_service(&unit, scope).await?,
        "restart" => units.restart_service(&unit, scope).await?,
        "enable" => units.enable_service(&unit, scope).await?,
        "disable" => units.disable_service(&unit, scope).await?,
        _ => return Ok(StatusCode::NOT_FOUND),
    }
    Ok(ACCEPTED)
}

// ─────────────────────────────────────────────────────────────────────────────
// Power
// ─────────────────────────────────────────────────────────────────────────────

async fn get_power(State(state): State<AppState>) -> CastellanResult<Response> {
    let power = require(&state.power, "power")?;
    Ok(Json(power.capabilities()).into_response())
}

async fn power_reboot(State(state): State<AppState>) -> CastellanResult<StatusCode> {
    require(&state.power, "power")?.reboot().await?;
    Ok(ACCEPTED)
}

async fn power_off(State(state): State<AppState>) -> CastellanResult<StatusCode> {
    require(&state.power, "power")?.power_off().await?;
    Ok(ACCEPTED)
}
