use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use voxloop_core::error::{PipelineError, Result};
use voxloop_core::types::Stage;
use voxloop_media::Transcriber;

use crate::bounded;

/// Finalized audio → transcript, bounded by a timeout. No retries.
pub struct TranscriptionStage {
    transcriber: Arc<dyn Transcriber>,
    timeout: Duration,
}

impl TranscriptionStage {
    pub fn new(transcriber: Arc<dyn Transcriber>, timeout: Duration) -> Self {
        Self {
            transcriber,
            timeout,
        }
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Result<String> {
        let start = Instant::now();
        let text = bounded(
            Stage::Transcription,
            self.timeout,
            self.transcriber.transcribe(audio),
        )
        .await?
        .map_err(PipelineError::transcription)?;

        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::transcription(
                voxloop_core::error::ServiceError::NoSpeech,
            ));
        }

        debug!(
            transcriber = self.transcriber.name(),
            bytes = audio.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Transcribed audio"
        );
        Ok(text.to_string())
    }
}
