//! HTTP control surface: system lifecycle, settings, and the WebSocket
//! endpoint.

use crate::config::Language;
use crate::error::DialogueError;
use crate::pipeline::{
    CAPTURE_SERVICE, MONITOR_SERVICE, PipelineContext, TTS_SERVICE, capture_service,
    monitor_service, tts_service,
};
use crate::prompts::PromptStore;
use crate::server::ws::{ConnectionManager, handle_socket};
use crate::services::{ManagerStatus, ServiceManager};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Shared application state for the HTTP surface.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<PipelineContext>,
    pub manager: Arc<Mutex<ServiceManager>>,
    pub connections: Arc<ConnectionManager>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/system/start", post(start_system))
        .route("/api/v1/system/stop", post(stop_system))
        .route("/api/v1/system/pause", post(pause_system))
        .route("/api/v1/system/resume", post(resume_system))
        .route("/api/v1/system/restart", post(restart_system))
        .route("/api/v1/system/status", get(system_status))
        .route("/api/v1/asr/languages", get(asr_languages))
        .route("/api/v1/tts/voice", put(set_tts_voice))
        .route(
            "/api/v1/settings/prompts",
            get(get_prompts).put(update_prompt),
        )
        .route("/api/v1/settings/prompts/reset", post(reset_prompts))
        .route("/api/v1/settings/prompts/defaults", get(default_prompts))
        .route("/api/v1/ws", get(ws_upgrade))
        .with_state(state)
}

/// Generic success/message response.
#[derive(Debug, Serialize)]
struct SystemResponse {
    success: bool,
    message: String,
}

impl SystemResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    fn rejected(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

/// Error wrapper turning pipeline errors into 500 responses.
struct ApiError(DialogueError);

impl From<DialogueError> for ApiError {
    fn from(e: DialogueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("API request failed: {}", self.0);
        (StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string()).into_response()
    }
}

// --- system control ---

async fn start_system(State(state): State<AppState>) -> Result<Json<SystemResponse>, ApiError> {
    let mut manager = state.manager.lock().await;
    if manager.is_service_running(CAPTURE_SERVICE) {
        return Ok(SystemResponse::rejected("system is already running"));
    }

    // A new run is a new dialogue session; in-flight tasks carrying the
    // old id die at their next checkpoint.
    let session_id = state.ctx.registry.reset_session_id();
    info!("system start: new session {session_id}");

    manager.start_service(monitor_service(&state.ctx)).await?;
    manager.start_service(capture_service(&state.ctx)).await?;
    state.ctx.playback_stopped.store(false, Ordering::Relaxed);
    state.ctx.capture_paused.store(false, Ordering::Relaxed);

    Ok(SystemResponse::ok("system started"))
}

async fn stop_system(State(state): State<AppState>) -> Json<SystemResponse> {
    let mut manager = state.manager.lock().await;
    let mut stopped = false;
    stopped |= manager.stop_service(CAPTURE_SERVICE).await;
    stopped |= manager.stop_service(MONITOR_SERVICE).await;
    state.ctx.playback_stopped.store(true, Ordering::Relaxed);

    if stopped {
        SystemResponse::ok("system stopped")
    } else {
        SystemResponse::rejected("system is not running")
    }
}

async fn pause_system(State(state): State<AppState>) -> Json<SystemResponse> {
    state.ctx.capture_paused.store(true, Ordering::Relaxed);
    SystemResponse::ok("capture paused")
}

async fn resume_system(State(state): State<AppState>) -> Json<SystemResponse> {
    state.ctx.capture_paused.store(false, Ordering::Relaxed);
    SystemResponse::ok("capture resumed")
}

async fn restart_system(
    state: State<AppState>,
) -> Result<Json<SystemResponse>, ApiError> {
    let _ = stop_system(state.clone()).await;
    start_system(state).await?;
    Ok(SystemResponse::ok("system restarted"))
}

/// System status payload.
#[derive(Debug, Serialize)]
struct SystemStatusResponse {
    status: &'static str,
    session_id: String,
    audio_capture_running: bool,
    audio_capture_ready: bool,
    services_count: usize,
    services_details: ManagerStatus,
}

async fn system_status(State(state): State<AppState>) -> Json<SystemStatusResponse> {
    let manager = state.manager.lock().await;
    let capture_running = manager.is_service_running(CAPTURE_SERVICE);
    let details = manager.status();
    Json(SystemStatusResponse {
        status: if capture_running { "running" } else { "stopped" },
        session_id: state.ctx.registry.current_session_id(),
        audio_capture_running: capture_running,
        audio_capture_ready: manager.is_service_ready(CAPTURE_SERVICE),
        services_count: details.total_services,
        services_details: details,
    })
}

// --- engines ---

async fn asr_languages() -> Json<Vec<&'static str>> {
    Json(vec!["zh", "en"])
}

#[derive(Debug, Deserialize)]
struct VoiceChangeRequest {
    voice: String,
}

/// Swap the TTS engine for a new voice. The playback queue survives and
/// in-flight clips stay valid (they already carry their audio).
async fn set_tts_voice(
    State(state): State<AppState>,
    Json(request): Json<VoiceChangeRequest>,
) -> Result<Json<SystemResponse>, ApiError> {
    let mut manager = state.manager.lock().await;
    manager.stop_service(TTS_SERVICE).await;

    let mut tts_config = state.ctx.config.tts.clone();
    tts_config.voice = request.voice.clone();
    manager
        .start_service(tts_service(&state.ctx, tts_config))
        .await?;

    Ok(SystemResponse::ok(format!("voice changed to {}", request.voice)))
}

// --- settings ---

#[derive(Debug, Serialize)]
struct PromptsResponse {
    chinese_prompt: String,
    english_prompt: String,
}

fn prompts_of(store: &PromptStore) -> Json<PromptsResponse> {
    Json(PromptsResponse {
        chinese_prompt: store.raw_prompt(Language::Zh),
        english_prompt: store.raw_prompt(Language::En),
    })
}

async fn get_prompts(State(state): State<AppState>) -> Json<PromptsResponse> {
    prompts_of(&state.ctx.prompts)
}

#[derive(Debug, Deserialize)]
struct PromptUpdateRequest {
    language: Language,
    prompt: String,
}

async fn update_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptUpdateRequest>,
) -> Result<Json<PromptsResponse>, ApiError> {
    state
        .ctx
        .prompts
        .set_prompt(request.language, &request.prompt)?;
    Ok(prompts_of(&state.ctx.prompts))
}

async fn reset_prompts(
    State(state): State<AppState>,
) -> Result<Json<PromptsResponse>, ApiError> {
    state.ctx.prompts.reset()?;
    Ok(prompts_of(&state.ctx.prompts))
}

async fn default_prompts() -> Json<PromptsResponse> {
    Json(PromptsResponse {
        chinese_prompt: PromptStore::default_prompt(Language::Zh).to_owned(),
        english_prompt: PromptStore::default_prompt(Language::En).to_owned(),
    })
}

// --- websocket ---

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let session_id = state.ctx.registry.current_session_id();
    let connections = Arc::clone(&state.connections);
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, connections))
}
