//! Mapping of pipeline failures onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use voxloop_core::error::{PipelineError, TranscriptionReason};

/// HTTP status for a pipeline failure.
pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::EmptyChunk | PipelineError::EmptyBuffer => StatusCode::BAD_REQUEST,
        PipelineError::BufferFull { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::SessionBusy(_) => StatusCode::CONFLICT,
        PipelineError::Transcription { reason, .. } => match reason {
            TranscriptionReason::NoSpeech => StatusCode::UNPROCESSABLE_ENTITY,
            TranscriptionReason::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            TranscriptionReason::Rejected => StatusCode::BAD_GATEWAY,
        },
        PipelineError::Dialogue(e) | PipelineError::Synthesis(e) => {
            if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_GATEWAY
            }
        }
        PipelineError::FormatConversion(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ServiceTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Config(_)
        | PipelineError::Io(_)
        | PipelineError::Json(_)
        | PipelineError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error returned by the JSON session API.
#[derive(Debug)]
pub enum ApiError {
    Pipeline(PipelineError),
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Pipeline(e) => status_for(e),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Pipeline(e) => e.code(),
            Self::BadRequest(_) => "bad_request",
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "error": self.code(),
            "transient": false,
        });

        match &self {
            Self::Pipeline(err) => {
                body["message"] = json!(err.to_string());
                body["transient"] = json!(err.is_transient());
                if let PipelineError::Transcription { reason, .. } = err {
                    body["reason"] = json!(reason);
                }
                if status.is_server_error() {
                    tracing::warn!(code = err.code(), %status, "Request failed: {err}");
                } else {
                    tracing::debug!(code = err.code(), %status, "Request rejected: {err}");
                }
            }
            Self::BadRequest(message) => {
                body["message"] = json!(message);
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_error(self.code());

        (status, Json(body)).into_response()
    }
}

/// Plain-text error for the device-compatible routes.
#[derive(Debug)]
pub struct TextError(pub PipelineError);

impl From<PipelineError> for TextError {
    fn from(err: PipelineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for TextError {
    fn into_response(self) -> Response {
        let message = match &self.0 {
            PipelineError::EmptyChunk => "No data received".to_string(),
            other => other.to_string(),
        };
        (status_for(&self.0), message).into_response()
    }
}
