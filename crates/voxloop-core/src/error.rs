use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Stage;

/// Failure reported by an external capability (transcriber, responder, synthesizer).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The audio contained no recognizable speech.
    #[error("no speech detected")]
    NoSpeech,

    /// Transport failure, overload or server-side error. Retrying may succeed.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service rejected the request (malformed input, auth, quota).
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Classify an HTTP status returned by a capability endpoint.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("HTTP {status}: {body}");
        if status == 429 || status >= 500 {
            Self::Unavailable(detail)
        } else {
            Self::Rejected(detail)
        }
    }
}

/// Why a transcription round failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionReason {
    NoSpeech,
    ServiceUnavailable,
    Rejected,
}

impl TranscriptionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSpeech => "no_speech",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TranscriptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ServiceError> for TranscriptionReason {
    fn from(err: &ServiceError) -> Self {
        match err {
            ServiceError::NoSpeech => Self::NoSpeech,
            ServiceError::Unavailable(_) => Self::ServiceUnavailable,
            ServiceError::Rejected(_) => Self::Rejected,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("empty audio chunk")]
    EmptyChunk,

    #[error("no audio buffered since the last finalize")]
    EmptyBuffer,

    #[error("audio buffer would exceed {limit} bytes")]
    BufferFull { limit: usize },

    #[error("transcription failed ({reason}): {detail}")]
    Transcription {
        reason: TranscriptionReason,
        detail: String,
    },

    #[error("dialogue failed: {0}")]
    Dialogue(ServiceError),

    #[error("synthesis failed: {0}")]
    Synthesis(ServiceError),

    #[error("format conversion failed: {0}")]
    FormatConversion(String),

    #[error("{stage} service timed out after {after:?}")]
    ServiceTimeout { stage: Stage, after: Duration },

    #[error("session {0} is busy with another request")]
    SessionBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn transcription(err: ServiceError) -> Self {
        Self::Transcription {
            reason: TranscriptionReason::from(&err),
            detail: err.to_string(),
        }
    }

    /// Stable snake_case identifier used on the wire and in metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyChunk => "empty_chunk",
            Self::EmptyBuffer => "empty_buffer",
            Self::BufferFull { .. } => "buffer_full",
            Self::Transcription { .. } => "transcription_error",
            Self::Dialogue(_) => "dialogue_error",
            Self::Synthesis(_) => "synthesis_error",
            Self::FormatConversion(_) => "format_conversion_error",
            Self::ServiceTimeout { .. } => "service_timeout",
            Self::SessionBusy(_) => "session_busy",
            Self::NotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Io(_) | Self::Json(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Whether the caller may reasonably retry the same operation unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ServiceTimeout { .. } | Self::SessionBusy(_) => true,
            Self::Transcription { reason, .. } => *reason == TranscriptionReason::ServiceUnavailable,
            Self::Dialogue(e) | Self::Synthesis(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
