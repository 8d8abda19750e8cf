//! HTTP and WebSocket surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures_util::StreamExt as _;
use relay_protocol::StartRun;

use crate::backend::Backends;
use crate::dispatcher::Connection;
use crate::error::{RecordingError, RunError, SpawnError};
use crate::recording::Recorder;
use crate::runs::{LineStream, RunManager};

const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub backends: Arc<Backends>,
    pub runs: Arc<RunManager>,
}

impl AppState {
    fn recorder(&self) -> &Arc<Recorder> {
        self.backends.recorder()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Run(RunError::UnknownRun(_)) | ApiError::Recording(RecordingError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Run(RunError::Cwd(_) | RunError::Spawn(SpawnError::BinaryNotFound { .. })) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Run(RunError::Spawn(_) | RunError::Io(_))
            | ApiError::Recording(RecordingError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("request failed: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/runs/start", post(start_run))
        .route("/api/runs/stream/:run_id", get(stream_run))
        .route("/api/runs/task/:run_id/output", get(run_output))
        .route("/api/runs/task/:run_id/stop", post(stop_run))
        .route("/api/terminal/snapshot/:session_id", get(snapshot))
        .route("/api/terminal/replay/:session_id", get(replay))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "runStrategy": state.runs.strategy(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.backends))
}

async fn handle_socket(mut socket: WebSocket, backends: Arc<Backends>) {
    tracing::debug!("client connected");
    let mut conn = Connection::new(backends);

    'conn: loop {
        tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("websocket read error: {e}");
                        break;
                    }
                };
                for frame in conn.handle_text(&text).await {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break 'conn;
                    }
                }
            }
            event = conn.next_event() => {
                if let Some(frame) = conn.handle_event(event)
                    && socket.send(Message::Text(frame)).await.is_err()
                {
                    break;
                }
            }
        }
    }

    tracing::debug!(sessions = conn.session_count(), "client disconnected");
    conn.shutdown();
}

fn ndjson(stream: LineStream) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, NDJSON)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .unwrap_or_else(|e| {
            tracing::warn!("failed to build stream response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRun>,
) -> Result<Response, ApiError> {
    let started = state.runs.start(&req).await?;
    Ok(match started.stream {
        Some(stream) => ndjson(stream),
        None => Json(started.started).into_response(),
    })
}

async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    Ok(ndjson(state.runs.subscribe(&run_id).await?))
}

#[derive(Debug, serde::Deserialize)]
struct OffsetQuery {
    #[serde(default)]
    offset: u64,
}

async fn run_output(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<OffsetQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.read(&run_id, query.offset).await?))
}

async fn stop_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.runs.stop(&run_id).await?))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TailQuery {
    tail_bytes: Option<usize>,
}

async fn snapshot(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .recorder()
            .snapshot(&session_id, query.tail_bytes)
            .await?,
    ))
}

async fn replay(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let text = state
        .recorder()
        .replay(&session_id, query.tail_bytes)
        .await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
