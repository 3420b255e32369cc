use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use voxloop_core::error::{PipelineError, Result, ServiceError};
use voxloop_core::types::{AudioFormat, AudioPayload, Stage, TargetFormat};
use voxloop_media::Synthesizer;

use crate::bounded;

/// Reply text → audio, plus conversion to a client's delivery format.
pub struct SynthesisStage {
    synthesizer: Arc<dyn Synthesizer>,
    timeout: Duration,
}

impl SynthesisStage {
    pub fn new(synthesizer: Arc<dyn Synthesizer>, timeout: Duration) -> Self {
        Self {
            synthesizer,
            timeout,
        }
    }

    pub fn native_format(&self) -> AudioFormat {
        self.synthesizer.native_format()
    }

    /// Fail early on a delivery format that conversion would reject.
    pub fn check_target(&self, target: &TargetFormat) -> Result<()> {
        voxloop_media::transcode::check_target(target)
    }

    /// Synthesize `text` in the synthesizer's native format.
    pub async fn synthesize(&self, text: &str) -> Result<AudioPayload> {
        let start = Instant::now();
        let audio = bounded(Stage::Synthesis, self.timeout, self.synthesizer.synthesize(text))
            .await?
            .map_err(PipelineError::Synthesis)?;

        if audio.is_empty() {
            return Err(PipelineError::Synthesis(ServiceError::Rejected(
                "synthesizer returned no audio".into(),
            )));
        }

        debug!(
            synthesizer = self.synthesizer.name(),
            bytes = audio.data.len(),
            audio_ms = audio.format.duration_ms(audio.data.len()),
            sample_rate = audio.format.sample_rate,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Synthesized reply"
        );
        Ok(audio)
    }

    /// Convert to `target`. Pure; no capability call.
    pub fn transcode(&self, audio: &AudioPayload, target: &TargetFormat) -> Result<AudioPayload> {
        voxloop_media::transcode(audio, target)
    }
}
