//! Stub capabilities and request helpers shared by the handler tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use tower::ServiceExt;

use voxloop_core::config::Config;
use voxloop_core::error::ServiceError;
use voxloop_core::types::{AudioFormat, AudioPayload, ConversationTurn};
use voxloop_media::{Synthesizer, Transcriber};
use voxloop_pipeline::{Capabilities, PipelineController, StageTimeouts};
use voxloop_providers::Responder;

use crate::server::router;
use crate::state::GatewayState;

pub(crate) struct StubTranscriber(pub Result<String, ServiceError>);

#[async_trait]
impl Transcriber for StubTranscriber {
    fn name(&self) -> &str {
        "stub"
    }

    async fn transcribe(&self, _audio: &[u8]) -> Result<String, ServiceError> {
        self.0.clone()
    }
}

pub(crate) struct StubResponder(pub Result<String, ServiceError>);

#[async_trait]
impl Responder for StubResponder {
    fn id(&self) -> &str {
        "stub"
    }

    async fn respond(&self, _history: &[ConversationTurn]) -> Result<String, ServiceError> {
        self.0.clone()
    }
}

/// 100 ms of 16 kHz mono 16-bit silence.
pub(crate) struct StubSynthesizer;

#[async_trait]
impl Synthesizer for StubSynthesizer {
    fn name(&self) -> &str {
        "stub"
    }

    fn native_format(&self) -> AudioFormat {
        AudioFormat::speech_16k()
    }

    async fn synthesize(&self, _text: &str) -> Result<AudioPayload, ServiceError> {
        Ok(AudioPayload::raw(AudioFormat::speech_16k(), vec![0; 3200]))
    }
}

pub(crate) fn app_with(
    transcript: Result<&str, ServiceError>,
    reply: Result<&str, ServiceError>,
) -> Router {
    let capabilities = Capabilities {
        transcriber: Arc::new(StubTranscriber(transcript.map(str::to_string))),
        responder: Arc::new(StubResponder(reply.map(str::to_string))),
        synthesizer: Arc::new(StubSynthesizer),
    };
    let pipeline = PipelineController::new(capabilities, StageTimeouts::uniform(Duration::from_secs(5)));
    let state = GatewayState::new(Arc::new(Config::default()), Arc::new(pipeline));
    router(Arc::new(state))
}

/// Default stubs with each session's upload buffer capped at `limit` bytes.
pub(crate) fn capped_app(limit: usize) -> Router {
    let capabilities = Capabilities {
        transcriber: Arc::new(StubTranscriber(Ok("hello".into()))),
        responder: Arc::new(StubResponder(Ok("hi there".into()))),
        synthesizer: Arc::new(StubSynthesizer),
    };
    let pipeline = PipelineController::new(capabilities, StageTimeouts::uniform(Duration::from_secs(5)))
        .with_max_buffer(limit);
    let state = GatewayState::new(Arc::new(Config::default()), Arc::new(pipeline));
    router(Arc::new(state))
}

pub(crate) fn app() -> Router {
    app_with(Ok("hello"), Ok("hi there"))
}

pub(crate) async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: impl Into<Body>,
) -> (StatusCode, HeaderMap, Bytes) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes)
}

pub(crate) fn json(bytes: &Bytes) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}
