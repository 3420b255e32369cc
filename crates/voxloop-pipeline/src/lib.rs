//! Voice turn pipeline.
//!
//! Each session cycles through collect → transcribe → respond → synthesize.
//! The [`PipelineController`] owns all sessions, serializes work within a
//! session and lets independent sessions run concurrently.

use std::future::Future;
use std::time::Duration;

use voxloop_core::config::Config;
use voxloop_core::error::{PipelineError, Result};
use voxloop_core::types::Stage;

pub mod collector;
pub mod controller;
pub mod dialogue;
pub mod session;
pub mod synthesis;
pub mod transcription;

pub use collector::ChunkCollector;
pub use controller::{Capabilities, PipelineController};
pub use dialogue::{Conversation, DialogueStage};
pub use session::Session;
pub use synthesis::SynthesisStage;
pub use transcription::TranscriptionStage;

/// Upper bound on each capability call, per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub transcription: Duration,
    pub dialogue: Duration,
    pub synthesis: Duration,
}

impl StageTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transcription: config.stage_timeout(Stage::Transcription),
            dialogue: config.stage_timeout(Stage::Dialogue),
            synthesis: config.stage_timeout(Stage::Synthesis),
        }
    }

    /// The same limit for every stage.
    pub fn uniform(limit: Duration) -> Self {
        Self {
            transcription: limit,
            dialogue: limit,
            synthesis: limit,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Run a capability call under `after`, mapping expiry to [`PipelineError::ServiceTimeout`].
pub(crate) async fn bounded<T>(stage: Stage, after: Duration, call: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(after, call)
        .await
        .map_err(|_| PipelineError::ServiceTimeout { stage, after })
}
