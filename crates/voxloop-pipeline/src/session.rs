use chrono::{DateTime, Utc};

use voxloop_core::session::{PipelineState, SessionId, SessionSnapshot};
use voxloop_core::types::AudioPayload;

use crate::collector::ChunkCollector;
use crate::dialogue::Conversation;

/// All mutable state of one client's pipeline.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: PipelineState,
    pub collector: ChunkCollector,
    pub conversation: Conversation,
    pub last_transcript: Option<String>,
    pub last_reply: Option<String>,
    /// Native synthesizer output for `last_reply`.
    pub last_audio: Option<AudioPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: PipelineState::Idle,
            collector: ChunkCollector::new(),
            conversation: Conversation::new(),
            last_transcript: None,
            last_reply: None,
            last_audio: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A session whose upload buffer is capped at `limit` bytes.
    pub fn with_buffer_limit(id: SessionId, limit: usize) -> Self {
        Self {
            collector: ChunkCollector::with_limit(limit),
            ..Self::new(id)
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Back to IDLE with no buffered audio, history or cached outputs.
    pub fn reset(&mut self) {
        self.state = PipelineState::Idle;
        self.collector.clear();
        self.conversation.clear();
        self.last_transcript = None;
        self.last_reply = None;
        self.last_audio = None;
        self.touch();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state,
            buffered_bytes: self.collector.len(),
            history: self.conversation.turns().to_vec(),
            last_transcript: self.last_transcript.clone(),
            last_reply: self.last_reply.clone(),
            last_audio_format: self.last_audio.as_ref().map(|a| a.format),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_core::types::AudioFormat;

    #[test]
    fn test_reset_clears_everything() {
        let mut session = Session::new(SessionId::from("s1"));
        session.collector.append(b"abc").unwrap();
        session.state = PipelineState::Synthesized;
        session.last_transcript = Some("hello".into());
        session.last_reply = Some("hi".into());
        session.last_audio = Some(AudioPayload::raw(AudioFormat::speech_16k(), vec![0, 0]));

        session.reset();
        let snap = session.snapshot();
        assert_eq!(snap.state, PipelineState::Idle);
        assert_eq!(snap.buffered_bytes, 0);
        assert!(snap.history.is_empty());
        assert!(snap.last_reply.is_none());
        assert!(snap.last_audio_format.is_none());
        assert_eq!(snap.created_at, session.created_at);
    }

    #[test]
    fn test_buffer_limit_survives_reset() {
        let mut session = Session::with_buffer_limit(SessionId::from("s1"), 4);
        session.collector.append(b"abcd").unwrap();
        session.reset();
        assert!(session.collector.append(b"abcde").is_err());
        assert_eq!(session.snapshot().summary().turns, 0);
    }
}
