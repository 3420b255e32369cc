//! Session API.
//!
//! ```text
//! POST   /sessions                      create (optional {"id"})
//! GET    /sessions                      list
//! GET    /sessions/{id}                 snapshot
//! DELETE /sessions/{id}                 teardown
//! POST   /sessions/{id}/reset           back to idle, history cleared
//! POST   /sessions/{id}/chunks          raw audio bytes
//! POST   /sessions/{id}/transcribe      finalize buffer, transcribe
//! POST   /sessions/{id}/dialogue        reply to the transcript
//! GET    /sessions/{id}/audio           synthesized reply, ?sample_rate=&channels=&sample_width=&container=
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;

use voxloop_core::session::SessionId;
use voxloop_core::types::FormatRequest;

use crate::error::ApiError;
use crate::state::{GatewayState, observe, track_sessions};

type AppState = State<Arc<GatewayState>>;

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/reset", post(reset_session))
        .route("/sessions/{id}/chunks", post(upload_chunk))
        .route("/sessions/{id}/transcribe", post(transcribe))
        .route("/sessions/{id}/dialogue", post(dialogue))
        .route("/sessions/{id}/audio", get(audio))
}

#[derive(Debug, Default, Deserialize)]
struct CreateSession {
    id: Option<String>,
}

fn session_id(raw: impl Into<String>) -> std::result::Result<SessionId, ApiError> {
    let id = SessionId::new(raw);
    if !id.is_path_safe() {
        return Err(ApiError::BadRequest(format!(
            "session id '{id}' must be 1-128 characters of [A-Za-z0-9_-]"
        )));
    }
    Ok(id)
}

async fn create_session(
    State(state): AppState,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    // The body is optional, so it is parsed by hand rather than through `Json`.
    let request: CreateSession = if body.iter().all(u8::is_ascii_whitespace) {
        CreateSession::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
    };
    let id = request.id.map(session_id).transpose()?;

    let id = state.pipeline.start_session(id).await;
    track_sessions(&state).await;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn list_sessions(State(state): AppState) -> impl IntoResponse {
    Json(json!({ "sessions": state.pipeline.list_sessions().await }))
}

async fn get_session(
    State(state): AppState,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let snapshot = state.pipeline.snapshot(&session_id(id)?).await?;
    Ok(Json(snapshot))
}

async fn delete_session(
    State(state): AppState,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.pipeline.teardown(&session_id(id)?).await?;
    track_sessions(&state).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn reset_session(
    State(state): AppState,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    state.pipeline.reset(&session_id(id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_chunk(
    State(state): AppState,
    Path(id): Path<String>,
    body: Bytes,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = session_id(id)?;
    let start = Instant::now();
    let result = state.pipeline.upload_chunk(&id, &body).await;
    observe("upload", start, &result);
    let length = result?;
    track_sessions(&state).await;
    Ok(Json(json!({ "length": length })))
}

async fn transcribe(
    State(state): AppState,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = session_id(id)?;
    let start = Instant::now();
    let result = state.pipeline.finalize_and_transcribe(&id).await;
    observe("transcribe", start, &result);
    Ok(Json(json!({ "transcript": result? })))
}

async fn dialogue(
    State(state): AppState,
    Path(id): Path<String>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = session_id(id)?;
    let start = Instant::now();
    let result = state.pipeline.advance_dialogue(&id).await;
    observe("dialogue", start, &result);
    Ok(Json(json!({ "reply": result? })))
}

async fn audio(
    State(state): AppState,
    Path(id): Path<String>,
    Query(request): Query<FormatRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let id = session_id(id)?;
    let start = Instant::now();
    let result = state.pipeline.synthesize_reply(&id, request).await;
    observe("synthesize", start, &result);
    let audio = result?;

    let headers = [
        (header::CONTENT_TYPE, audio.container.mime_type().to_string()),
        (
            header::HeaderName::from_static("x-sample-rate"),
            audio.format.sample_rate.to_string(),
        ),
        (
            header::HeaderName::from_static("x-channels"),
            audio.format.channels.to_string(),
        ),
        (
            header::HeaderName::from_static("x-sample-width"),
            audio.format.sample_width.to_string(),
        ),
    ];
    Ok((headers, audio.data))
}
