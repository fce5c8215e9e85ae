use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use crate::auth::middleware::{AuthToken, ClientIp};
use crate::auth::rate_limit;
use crate::build::artifacts;
use crate::build::logbuf::{FrameType, LogBuffer, LogFrame};
use crate::error::ApiError;
use crate::status::{UnifiedBuildStatus, aggregator};
use crate::store::{AppState, releases, services};
use crate::validation;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/services/{id}/builds/{sha}/status", get(build_status))
        .route(
            "/v1/services/{id}/builds/{release_id}/logs/stream",
            get(logs_stream),
        )
}

/// Status poll. Clients hit this every 5-10 s; the aggregator's cache absorbs
/// the storm, the per-IP limiter absorbs abuse.
async fn build_status(
    State(state): State<AppState>,
    _auth: AuthToken,
    ip: ClientIp,
    Path((id, sha)): Path<(Uuid, String)>,
) -> Result<Json<UnifiedBuildStatus>, ApiError> {
    validation::check_git_sha(&sha)?;

    rate_limit::check_ip(
        &state.valkey,
        rate_limit::RateScope::StatusPoll,
        ip.0.as_deref(),
        state.config.rate_limit_per_ip,
    )
    .await?;

    Ok(Json(aggregator::unified_status(&state, id, &sha).await?))
}

/// Log tail. Live builds multiplex from the dispatcher's ring buffer;
/// terminal builds replay from persisted log storage. Auth happens during the
/// HTTP upgrade (bearer header or `?token=` fallback).
async fn logs_stream(
    State(state): State<AppState>,
    _auth: AuthToken,
    Path((id, release_id)): Path<(Uuid, Uuid)>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let service = services::get(&state.pool, id).await?;
    let release = releases::get(&state.pool, release_id).await?;
    if release.service_id != service.id {
        return Err(ApiError::NotFound("release".into()));
    }

    Ok(ws.on_upgrade(move |socket| handle_stream(state, release, socket)))
}

async fn handle_stream(state: AppState, release: releases::Release, mut socket: WebSocket) {
    let connected = LogFrame {
        frame_type: FrameType::Connected,
        pod: None,
        container: None,
        timestamp: chrono::Utc::now(),
        message: format!("streaming logs for release v{}", release.version),
    };
    if send_frame(&mut socket, &connected).await.is_err() {
        return;
    }

    match state.log_bufs.get(release.id) {
        Some(buffer) => stream_live(&state, &release, buffer, &mut socket).await,
        None => stream_historical(&state, &release, &mut socket).await,
    }

    let disconnected = LogFrame {
        frame_type: FrameType::Disconnected,
        pod: None,
        container: None,
        timestamp: chrono::Utc::now(),
        message: "stream closed".into(),
    };
    let _ = send_frame(&mut socket, &disconnected).await;
    tracing::info!(release_id = %release.id, "log stream closed");
}

/// Replay the scrollback, then follow the broadcast until the build finishes
/// or the client hangs up. No per-client cursor survives the socket.
async fn stream_live(
    _state: &AppState,
    release: &releases::Release,
    buffer: Arc<LogBuffer>,
    socket: &mut WebSocket,
) {
    let mut rx = buffer.subscribe();

    for frame in buffer.snapshot() {
        if send_frame(socket, &frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if send_frame(socket, &frame).await.is_err() {
                            return; // client went away; tear down the tail
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(release_id = %release.id, skipped, "log subscriber lagged");
                    }
                    // Build finished and the buffer was dropped.
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return,
                    _ => {} // pings and stray client frames
                }
            }
        }
    }
}

/// Terminal builds: replay the persisted log file as `log` frames.
async fn stream_historical(
    state: &AppState,
    release: &releases::Release,
    socket: &mut WebSocket,
) {
    let path = artifacts::build_log_path(release.id);
    let content = match state.artifacts.read(&path).await {
        Ok(buf) => String::from_utf8_lossy(&buf.to_bytes()).into_owned(),
        Err(e) => {
            let frame = LogFrame::error(format!("no logs available: {e}"));
            let _ = send_frame(socket, &frame).await;
            return;
        }
    };

    for line in content.lines() {
        let frame = LogFrame {
            frame_type: FrameType::Log,
            pod: None,
            container: None,
            timestamp: chrono::Utc::now(),
            message: line.to_owned(),
        };
        if send_frame(socket, &frame).await.is_err() {
            return;
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &LogFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}
