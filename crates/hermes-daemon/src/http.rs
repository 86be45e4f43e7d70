use crate::bridge::NowPlayingBoard;
use crate::core::DaemonEvent;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hermes_proto::protocol::{Command, NowPlaying, RemoteCommand, Station};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    board: NowPlayingBoard,
    event_tx: mpsc::Sender<DaemonEvent>,
}

#[derive(Serialize)]
struct VolumeStatus {
    volume: u8,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    board: NowPlayingBoard,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(board, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(board: NowPlayingBoard, event_tx: mpsc::Sender<DaemonEvent>) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/art", get(get_art))
        .route("/api/play", post(play))
        .route("/api/pause", post(pause))
        .route("/api/toggle", post(toggle))
        .route("/api/stop", post(stop))
        .route("/api/next", post(next))
        .route("/api/like", post(like))
        .route("/api/dislike", post(dislike))
        .route("/api/tired", post(tired))
        .route("/api/station", post(play_station))
        .route("/api/volume/:volume", post(set_volume))
        .route("/api/volume", get(get_volume))
        .with_state(HttpState { board, event_tx })
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
        error!("HTTP API: daemon event channel closed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn remote(state: &HttpState, command: RemoteCommand) -> StatusCode {
    info!("HTTP API: {:?}", command);
    send(state, Command::Remote { command }).await
}

async fn get_state(State(state): State<HttpState>) -> Json<NowPlaying> {
    Json(state.board.snapshot().await)
}

async fn get_art(State(state): State<HttpState>) -> Response {
    let Some(bytes) = state.board.snapshot().await.artwork else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let content_type = sniff_image_type(&bytes);
    ([(header::CONTENT_TYPE, content_type)], bytes.to_vec()).into_response()
}

fn sniff_image_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}

async fn play(State(state): State<HttpState>) -> StatusCode {
    remote(&state, RemoteCommand::Play).await
}

async fn pause(State(state): State<HttpState>) -> StatusCode {
    remote(&state, RemoteCommand::Pause).await
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    remote(&state, RemoteCommand::TogglePlayPause).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    remote(&state, RemoteCommand::Stop).await
}

async fn next(State(state): State<HttpState>) -> StatusCode {
    remote(&state, RemoteCommand::Next).await
}

async fn like(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Like");
    send(&state, Command::Like).await
}

async fn dislike(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Dislike");
    send(&state, Command::Dislike).await
}

async fn tired(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Tired");
    send(&state, Command::Tired).await
}

async fn play_station(State(state): State<HttpState>, Json(station): Json<Station>) -> StatusCode {
    info!("HTTP API: Play station {}", station.id);
    send(&state, Command::PlayStation { station }).await
}

async fn set_volume(State(state): State<HttpState>, Path(volume): Path<u16>) -> StatusCode {
    let value = volume.min(100) as u8;
    info!("HTTP API: Set volume to {}%", value);
    send(&state, Command::Volume { value }).await
}

async fn get_volume(State(state): State<HttpState>) -> Json<VolumeStatus> {
    let volume = state.board.snapshot().await.volume;
    Json(VolumeStatus { volume })
}
