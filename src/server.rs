use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::effects::Effect;
use crate::events::sse_event;
use crate::llm::ModelSettings;
use crate::shell::{ShellSnapshot, StartOutcome, Submission};
use crate::ui;

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>, settings: ModelSettings) -> anyhow::Result<()> {
    info!(
        name: "llm.config.loaded",
        base_url = %settings.base_url,
        text_model = %settings.text_model,
        image_model = %settings.image_model,
        provider = ?settings.provider,
        configured = settings.api_key.is_some(),
        "Model configuration loaded"
    );
    if settings.api_key.is_none() {
        warn!(
            name: "llm.config.no_credential",
            "No API credential found, the game will run disconnected"
        );
    }

    let state = AppState::new(Arc::clone(&config), settings);
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// Build the router for a game.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/state", get(api_state))
        .route("/api/boot", post(api_boot))
        .route("/api/start", post(api_start))
        .route("/api/command", post(api_command))
        .route("/api/effects/mute", post(api_mute))
        .route("/api/effects/keystroke", post(api_keystroke))
        .route("/api/events", get(api_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// API Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET / - The terminal page.
async fn index_handler() -> impl IntoResponse {
    Html(ui::terminal_page())
}

/// GET /api/state - Full snapshot for (re)rendering.
async fn api_state(State(state): State<AppState>) -> Json<ShellSnapshot> {
    Json(state.shell.snapshot())
}

/// POST /api/boot - Play the boot sequence in the background.
async fn api_boot(State(state): State<AppState>) -> StatusCode {
    let shell = state.shell.clone();
    tokio::spawn(async move {
        if !shell.run_boot_sequence().await {
            tracing::debug!("Boot sequence already ran");
        }
    });
    StatusCode::ACCEPTED
}

/// POST /api/start - Leave the boot screen.
async fn api_start(State(state): State<AppState>) -> Json<StartOutcome> {
    Json(state.shell.start().await)
}

/// Request body for the command API.
#[derive(Debug, Deserialize)]
struct CommandRequest {
    /// The line as typed.
    input: String,
}

/// POST /api/command - Submit one input line.
async fn api_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Json<Submission> {
    let submission = state.shell.submit(&req.input);
    tracing::debug!(outcome = ?submission, "Command handled");
    Json(submission)
}

#[derive(Debug, Serialize)]
struct MuteResponse {
    muted: bool,
}

/// POST /api/effects/mute - Toggle ambient sound.
async fn api_mute(State(state): State<AppState>) -> Json<MuteResponse> {
    Json(MuteResponse {
        muted: state.shell.effects().toggle_mute(),
    })
}

/// POST /api/effects/keystroke - Player typed a key.
async fn api_keystroke(State(state): State<AppState>) -> StatusCode {
    state.shell.effects().trigger(Effect::Keystroke);
    StatusCode::NO_CONTENT
}

/// GET /api/events - SSE stream of game events.
async fn api_events(State(state): State<AppState>) -> Response {
    let events = BroadcastStream::new(state.shell.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok::<String, Infallible>(sse_event(&event))),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(name: "sse.lagged", skipped, "SSE subscriber lagged, events dropped");
                None
            }
        }
    });

    info!(name: "sse.connected", "Event stream opened");
    build_sse_response(Body::from_stream(events))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn build_sse_response(body: Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    h.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    h.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    resp
}
