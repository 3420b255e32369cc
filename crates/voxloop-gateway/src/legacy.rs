//! Device-compatible routes operating on the default session.
//!
//! A device records and uploads in chunks, then walks the remaining stages
//! with one GET each: `/get_response` (transcript), `/get_response2`
//! (reply), `/get_wav` (spoken reply as WAV). Responses are plain text.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};

use voxloop_core::types::FormatRequest;

use crate::error::TextError;
use crate::state::{GatewayState, observe, track_sessions};

pub fn router() -> Router<Arc<GatewayState>> {
    Router::new()
        .route("/upload", post(upload))
        .route("/get_response", get(get_response))
        .route("/get_response2", get(get_response2))
        .route("/get_wav", get(get_wav))
}

async fn upload(
    State(state): State<Arc<GatewayState>>,
    body: Bytes,
) -> Result<&'static str, TextError> {
    let start = Instant::now();
    let result = state.pipeline.upload_chunk(&state.default_session, &body).await;
    observe("upload", start, &result);
    result?;
    track_sessions(&state).await;
    Ok("Chunk received")
}

async fn get_response(State(state): State<Arc<GatewayState>>) -> Result<String, TextError> {
    let start = Instant::now();
    let result = state
        .pipeline
        .finalize_and_transcribe(&state.default_session)
        .await;
    observe("transcribe", start, &result);
    Ok(result?)
}

async fn get_response2(State(state): State<Arc<GatewayState>>) -> Result<String, TextError> {
    let start = Instant::now();
    let result = state.pipeline.advance_dialogue(&state.default_session).await;
    observe("dialogue", start, &result);
    Ok(result?)
}

async fn get_wav(
    State(state): State<Arc<GatewayState>>,
) -> Result<impl IntoResponse, TextError> {
    let start = Instant::now();
    let result = state
        .pipeline
        .synthesize_reply(&state.default_session, FormatRequest::wav())
        .await;
    observe("synthesize", start, &result);
    let audio = result?;
    Ok(([(header::CONTENT_TYPE, "audio/wav")], audio.data))
}

#[cfg(test)]
mod tests {
    use crate::testing::{app, capped_app, send};

    #[tokio::test]
    async fn test_device_turn() {
        let app = app();

        let (status, _, body) = send(&app, "POST", "/upload", vec![7u8; 320]).await;
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"Chunk received");
        send(&app, "POST", "/upload", vec![7u8; 320]).await;

        let (status, _, body) = send(&app, "GET", "/get_response", "").await;
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"hello");

        let (_, _, body) = send(&app, "GET", "/get_response2", "").await;
        assert_eq!(&body[..], b"hi there");

        let (status, headers, body) = send(&app, "GET", "/get_wav", "").await;
        assert_eq!(status, 200);
        assert_eq!(headers["content-type"], "audio/wav");
        assert_eq!(&body[..4], b"RIFF");
        assert_eq!(body.len(), 44 + 3200);

        // The turn ran on the default session.
        let (status, _, _) = send(&app, "GET", "/sessions/default", "").await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let app = app();
        let (status, _, body) = send(&app, "POST", "/upload", "").await;
        assert_eq!(status, 400);
        assert_eq!(&body[..], b"No data received");
    }

    #[tokio::test]
    async fn test_upload_past_cap() {
        let app = capped_app(500);
        send(&app, "POST", "/upload", vec![7u8; 320]).await;
        let (status, _, _) = send(&app, "POST", "/upload", vec![7u8; 320]).await;
        assert_eq!(status, 413);

        // The accepted chunk is still there to transcribe.
        let (status, _, body) = send(&app, "GET", "/get_response", "").await;
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_out_of_order_call() {
        let app = app();
        let (status, _, _) = send(&app, "GET", "/get_response", "").await;
        assert_eq!(status, 404);
    }
}
