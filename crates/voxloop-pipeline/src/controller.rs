//! Session registry and the per-session state machine.
//!
//! ```text
//! IDLE ──append──▶ COLLECTING ──finalize+transcribe──▶ TRANSCRIBED
//!                     ▲                                     │ advance
//!                     │ append (any state)                  ▼
//!               SYNTHESIZED ◀──────synthesize─────────── RESPONDED
//! ```
//!
//! At most one operation runs per session: a second caller gets
//! [`PipelineError::SessionBusy`] instead of queueing. Teardown cancels any
//! in-flight capability call and its result is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxloop_core::cache::{ArtifactCache, CacheEntry, FsArtifactCache};
use voxloop_core::config::Config;
use voxloop_core::error::{PipelineError, Result};
use voxloop_core::session::{PipelineState, SessionId, SessionSnapshot, SessionSummary};
use voxloop_core::types::{AudioPayload, FormatRequest};
use voxloop_media::{Synthesizer, Transcriber, build_synthesizer, build_transcriber};
use voxloop_providers::{Responder, build_responder};

use crate::StageTimeouts;
use crate::dialogue::DialogueStage;
use crate::session::Session;
use crate::synthesis::SynthesisStage;
use crate::transcription::TranscriptionStage;

/// The three external services a pipeline depends on.
pub struct Capabilities {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Capabilities {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            transcriber: build_transcriber(config)?,
            responder: build_responder(config)?,
            synthesizer: build_synthesizer(config)?,
        })
    }
}

struct Slot {
    session: Mutex<Session>,
    /// Latest published snapshot, readable while an operation holds `session`.
    view: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
}

impl Slot {
    fn new(id: SessionId, max_buffer: Option<usize>) -> Self {
        let session = match max_buffer {
            Some(limit) => Session::with_buffer_limit(id, limit),
            None => Session::new(id),
        };
        let (view, _) = watch::channel(session.snapshot());
        Self {
            session: Mutex::new(session),
            view,
            cancel: CancellationToken::new(),
        }
    }

    fn publish(&self, session: &mut Session) {
        session.touch();
        self.view.send_replace(session.snapshot());
    }
}

fn torn_down(id: &SessionId) -> PipelineError {
    PipelineError::NotFound(format!("session {id} was torn down"))
}

/// Claim the session for one operation, failing fast if another holds it.
fn claim<'a>(slot: &'a Slot, id: &SessionId) -> Result<MutexGuard<'a, Session>> {
    let guard = slot
        .session
        .try_lock()
        .map_err(|_| PipelineError::SessionBusy(id.to_string()))?;
    if slot.cancel.is_cancelled() {
        return Err(torn_down(id));
    }
    Ok(guard)
}

/// Race `call` against teardown of the session.
async fn until_torn_down<T>(
    slot: &Slot,
    id: &SessionId,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = slot.cancel.cancelled() => Err(torn_down(id)),
        result = call => {
            if slot.cancel.is_cancelled() {
                Err(torn_down(id))
            } else {
                result
            }
        }
    }
}

pub struct PipelineController {
    sessions: RwLock<HashMap<SessionId, Arc<Slot>>>,
    transcription: TranscriptionStage,
    dialogue: DialogueStage,
    synthesis: SynthesisStage,
    cache: Option<Arc<dyn ArtifactCache>>,
    max_buffer: Option<usize>,
}

impl PipelineController {
    pub fn new(capabilities: Capabilities, timeouts: StageTimeouts) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transcription: TranscriptionStage::new(capabilities.transcriber, timeouts.transcription),
            dialogue: DialogueStage::new(capabilities.responder, timeouts.dialogue),
            synthesis: SynthesisStage::new(capabilities.synthesizer, timeouts.synthesis),
            cache: None,
            max_buffer: None,
        }
    }

    /// Build adapters, timeouts and (if enabled) the artifact cache from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let controller = Self::new(
            Capabilities::from_config(config)?,
            StageTimeouts::from_config(config),
        )
        .with_max_buffer(config.max_buffer_bytes());
        Ok(match config.cache_dir() {
            Some(dir) => {
                info!(dir = %dir.display(), "Artifact cache enabled");
                controller.with_cache(Arc::new(FsArtifactCache::new(dir)))
            }
            None => controller,
        })
    }

    pub fn with_cache(mut self, cache: Arc<dyn ArtifactCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Cap each session's upload buffer at `bytes`.
    pub fn with_max_buffer(mut self, bytes: usize) -> Self {
        self.max_buffer = Some(bytes);
        self
    }

    async fn slot(&self, id: &SessionId) -> Result<Arc<Slot>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::NotFound(format!("session {id}")))
    }

    async fn slot_or_create(&self, id: &SessionId) -> Arc<Slot> {
        if let Some(slot) = self.sessions.read().await.get(id) {
            return slot.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(id.clone())
            .or_insert_with(|| {
                info!(session = %id, "Session started");
                Arc::new(Slot::new(id.clone(), self.max_buffer))
            })
            .clone()
    }

    /// Append to the artifact cache unless the session was torn down.
    ///
    /// Callers hold the session lock, which teardown takes before deleting
    /// the session's cache directory.
    async fn record(&self, slot: &Slot, id: &SessionId, entry: CacheEntry) {
        if slot.cancel.is_cancelled() {
            return;
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.append(id, &entry).await {
                warn!(session = %id, error = %e, "Failed to write artifact cache");
            }
        }
    }

    /// Create a session (or return the existing one with the same id).
    pub async fn start_session(&self, id: Option<SessionId>) -> SessionId {
        let id = id.unwrap_or_else(SessionId::generate);
        self.slot_or_create(&id).await;
        id
    }

    /// Append a chunk to the session's buffer, creating the session on
    /// first upload. Returns the new buffered length.
    pub async fn upload_chunk(&self, id: &SessionId, chunk: &[u8]) -> Result<usize> {
        if chunk.is_empty() {
            return Err(PipelineError::EmptyChunk);
        }
        let slot = self.slot_or_create(id).await;
        let mut session = claim(&slot, id)?;

        let len = session.collector.append(chunk)?;
        session.state = PipelineState::Collecting;
        slot.publish(&mut session);

        debug!(session = %id, chunk = chunk.len(), buffered = len, "Chunk appended");
        Ok(len)
    }

    /// Finalize the buffer and transcribe it.
    ///
    /// On failure the buffer is put back so the caller can retry; an empty
    /// buffer fails with [`PipelineError::EmptyBuffer`].
    pub async fn finalize_and_transcribe(&self, id: &SessionId) -> Result<String> {
        let slot = self.slot(id).await?;
        let mut session = claim(&slot, id)?;

        let audio = match session.collector.finalize() {
            Ok(audio) => audio,
            Err(e) => {
                if session.state == PipelineState::Collecting {
                    session.state = PipelineState::Idle;
                    slot.publish(&mut session);
                }
                return Err(e);
            }
        };

        let start = Instant::now();
        let result = until_torn_down(&slot, id, self.transcription.transcribe(&audio)).await;
        match result {
            Ok(text) => {
                session.state = PipelineState::Transcribed;
                session.last_transcript = Some(text.clone());
                slot.publish(&mut session);
                self.record(
                    &slot,
                    id,
                    CacheEntry::Transcript {
                        text: text.clone(),
                        timestamp: Utc::now(),
                    },
                )
                .await;
                info!(
                    session = %id,
                    bytes = audio.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Transcription complete"
                );
                Ok(text)
            }
            Err(e) => {
                if !slot.cancel.is_cancelled() {
                    session.collector.restore(audio);
                    session.state = PipelineState::Collecting;
                    slot.publish(&mut session);
                }
                warn!(session = %id, error = %e, "Transcription failed");
                Err(e)
            }
        }
    }

    /// Send the pending transcript to the responder and commit the round.
    pub async fn advance_dialogue(&self, id: &SessionId) -> Result<String> {
        let slot = self.slot(id).await?;
        let mut session = claim(&slot, id)?;

        let transcript = match (session.state, &session.last_transcript) {
            (PipelineState::Transcribed, Some(text)) => text.clone(),
            _ => {
                return Err(PipelineError::NotFound(format!(
                    "session {id} has no pending transcript"
                )));
            }
        };

        let start = Instant::now();
        let round = until_torn_down(
            &slot,
            id,
            self.dialogue.advance(&mut session.conversation, &transcript),
        )
        .await;
        let (user, assistant) = match round {
            Ok(turns) => turns,
            Err(e) => {
                warn!(session = %id, error = %e, "Dialogue round failed");
                return Err(e);
            }
        };

        session.state = PipelineState::Responded;
        session.last_reply = Some(assistant.content.clone());
        session.last_audio = None;
        slot.publish(&mut session);

        let reply = assistant.content.clone();
        self.record(&slot, id, CacheEntry::Turn { turn: user }).await;
        self.record(&slot, id, CacheEntry::Turn { turn: assistant }).await;
        info!(
            session = %id,
            turns = session.conversation.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dialogue round complete"
        );
        Ok(reply)
    }

    /// Synthesize the last reply and convert it as `request` asks.
    ///
    /// Re-requesting audio after a successful synthesis reuses the native
    /// audio and only converts it again.
    pub async fn synthesize_reply(
        &self,
        id: &SessionId,
        request: FormatRequest,
    ) -> Result<AudioPayload> {
        let slot = self.slot(id).await?;
        let mut session = claim(&slot, id)?;

        let reply = match session.state {
            PipelineState::Responded | PipelineState::Synthesized => session.last_reply.clone(),
            _ => None,
        }
        .ok_or_else(|| PipelineError::NotFound(format!("session {id} has no reply to synthesize")))?;

        let start = Instant::now();
        let (native, fresh) = match session.last_audio.clone() {
            Some(audio) if session.state == PipelineState::Synthesized => (audio, false),
            _ => {
                // Refuse an unusable target before paying for synthesis.
                if !request.is_native() {
                    self.synthesis
                        .check_target(&request.resolve(self.synthesis.native_format()))?;
                }
                match until_torn_down(&slot, id, self.synthesis.synthesize(&reply)).await {
                    Ok(audio) => (audio, true),
                    Err(e) => {
                        warn!(session = %id, error = %e, "Synthesis failed");
                        return Err(e);
                    }
                }
            }
        };

        let delivered = if request.is_native() {
            native.clone()
        } else {
            self.synthesis
                .transcode(&native, &request.resolve(native.format))?
        };

        if fresh && !slot.cancel.is_cancelled() {
            if let (Some(cache), Some(turn)) = (&self.cache, session.conversation.last_reply()) {
                if let Err(e) = cache.store_audio(id, turn.sequence, &native).await {
                    warn!(session = %id, error = %e, "Failed to cache synthesized audio");
                }
            }
        }

        session.state = PipelineState::Synthesized;
        session.last_audio = Some(native);
        slot.publish(&mut session);

        info!(
            session = %id,
            fresh,
            bytes = delivered.data.len(),
            sample_rate = delivered.format.sample_rate,
            channels = delivered.format.channels,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reply audio ready"
        );
        Ok(delivered)
    }

    /// Current view of a session. Does not wait for in-flight operations.
    pub async fn snapshot(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let slot = self.slot(id).await?;
        let snapshot = slot.view.borrow().clone();
        Ok(snapshot)
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|slot| slot.view.borrow().summary())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Clear buffer, history and outputs; the session returns to IDLE.
    pub async fn reset(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id).await?;
        let mut session = claim(&slot, id)?;
        session.reset();
        slot.publish(&mut session);
        self.record(&slot, id, CacheEntry::Reset { timestamp: Utc::now() }).await;
        info!(session = %id, "Session reset");
        Ok(())
    }

    /// Remove the session. An in-flight operation on it is cancelled and
    /// its result discarded.
    pub async fn teardown(&self, id: &SessionId) -> Result<()> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PipelineError::NotFound(format!("session {id}")))?;
        slot.cancel.cancel();

        if let Some(cache) = &self.cache {
            // Wait for a cancelled operation to release the session so it
            // cannot write into the directory after it is removed.
            let _session = slot.session.lock().await;
            if let Err(e) = cache.remove(id).await {
                warn!(session = %id, error = %e, "Failed to remove cached artifacts");
            }
        }
        info!(session = %id, "Session torn down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use voxloop_core::error::{ServiceError, TranscriptionReason};
    use voxloop_core::types::{
        AudioContainer, AudioFormat, ConversationTurn, Role, Stage, TargetFormat,
    };

    use super::*;

    // --- stub capabilities ---

    struct StubTranscriber {
        result: std::result::Result<String, ServiceError>,
        heard: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    impl StubTranscriber {
        fn new(result: std::result::Result<&str, ServiceError>) -> Self {
            Self {
                result: result.map(str::to_string),
                heard: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transcriber for StubTranscriber {
        fn name(&self) -> &str {
            "stub"
        }

        async fn transcribe(&self, audio: &[u8]) -> std::result::Result<String, ServiceError> {
            self.heard.lock().unwrap().push(audio.to_vec());
            self.result.clone()
        }
    }

    struct StalledTranscriber;

    #[async_trait]
    impl Transcriber for StalledTranscriber {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn transcribe(&self, _audio: &[u8]) -> std::result::Result<String, ServiceError> {
            std::future::pending().await
        }
    }

    /// Fails the first `failures` calls, then replies "hi there".
    struct StubResponder {
        failures: usize,
        calls: AtomicUsize,
    }

    impl StubResponder {
        fn ok() -> Self {
            Self::failing_first(0)
        }

        fn failing_first(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Responder for StubResponder {
        fn id(&self) -> &str {
            "stub"
        }

        async fn respond(&self, _history: &[ConversationTurn]) -> std::result::Result<String, ServiceError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ServiceError::Unavailable("model is loading".into()));
            }
            Ok("hi there".into())
        }
    }

    /// Signals `entered`, then blocks until `release`.
    struct GatedResponder {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl Responder for GatedResponder {
        fn id(&self) -> &str {
            "gated"
        }

        async fn respond(&self, _history: &[ConversationTurn]) -> std::result::Result<String, ServiceError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("eventually".into())
        }
    }

    /// 16 kHz mono 16-bit, counts calls.
    struct StubSynthesizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Synthesizer for StubSynthesizer {
        fn name(&self) -> &str {
            "stub"
        }

        fn native_format(&self) -> AudioFormat {
            AudioFormat::speech_16k()
        }

        async fn synthesize(&self, _text: &str) -> std::result::Result<AudioPayload, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AudioPayload::raw(AudioFormat::speech_16k(), vec![0; 1600 * 2]))
        }
    }

    fn synth() -> Arc<StubSynthesizer> {
        Arc::new(StubSynthesizer {
            calls: AtomicUsize::new(0),
        })
    }

    fn controller(
        transcriber: Arc<dyn Transcriber>,
        responder: Arc<dyn Responder>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Arc<PipelineController> {
        Arc::new(PipelineController::new(
            Capabilities {
                transcriber,
                responder,
                synthesizer,
            },
            StageTimeouts::uniform(Duration::from_secs(5)),
        ))
    }

    fn happy() -> Arc<PipelineController> {
        controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(StubResponder::ok()),
            synth(),
        )
    }

    fn sid(id: &str) -> SessionId {
        SessionId::from(id)
    }

    async fn state(c: &PipelineController, id: &SessionId) -> PipelineState {
        c.snapshot(id).await.unwrap().state
    }

    /// Drive a session to TRANSCRIBED.
    async fn transcribed(c: &PipelineController, id: &SessionId) {
        c.upload_chunk(id, b"AAAA").await.unwrap();
        c.finalize_and_transcribe(id).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_turn() {
        let transcriber = Arc::new(StubTranscriber::new(Ok("hello")));
        let c = controller(transcriber.clone(), Arc::new(StubResponder::ok()), synth());
        let id = sid("kitchen");

        assert_eq!(c.upload_chunk(&id, b"AAAA").await.unwrap(), 4);
        assert_eq!(state(&c, &id).await, PipelineState::Collecting);
        assert_eq!(c.upload_chunk(&id, b"BBBB").await.unwrap(), 8);

        assert_eq!(c.finalize_and_transcribe(&id).await.unwrap(), "hello");
        assert_eq!(transcriber.heard.lock().unwrap().as_slice(), &[b"AAAABBBB".to_vec()]);
        assert_eq!(state(&c, &id).await, PipelineState::Transcribed);

        assert_eq!(c.advance_dialogue(&id).await.unwrap(), "hi there");
        let snap = c.snapshot(&id).await.unwrap();
        assert_eq!(snap.state, PipelineState::Responded);
        let history: Vec<_> = snap
            .history
            .iter()
            .map(|t| (t.role, t.content.as_str()))
            .collect();
        assert_eq!(history, vec![(Role::User, "hello"), (Role::Assistant, "hi there")]);

        let target = TargetFormat {
            sample_rate: 22_050,
            channels: 2,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        let audio = c.synthesize_reply(&id, target.into()).await.unwrap();
        assert_eq!(audio.format, AudioFormat::new(22_050, 2, 16));

        let snap = c.snapshot(&id).await.unwrap();
        assert_eq!(snap.state, PipelineState::Synthesized);
        assert_eq!(snap.last_audio_format, Some(AudioFormat::speech_16k()));
        assert_eq!(snap.buffered_bytes, 0);

        // Next turn starts by speaking again.
        c.upload_chunk(&id, b"CCCC").await.unwrap();
        assert_eq!(state(&c, &id).await, PipelineState::Collecting);
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let c = happy();
        let id = c.start_session(None).await;

        assert!(matches!(
            c.upload_chunk(&id, b"").await,
            Err(PipelineError::EmptyChunk)
        ));
        assert!(matches!(
            c.finalize_and_transcribe(&id).await,
            Err(PipelineError::EmptyBuffer)
        ));
        assert_eq!(state(&c, &id).await, PipelineState::Idle);

        // An empty chunk does not create a session.
        assert!(c.upload_chunk(&sid("ghost"), b"").await.is_err());
        assert!(matches!(
            c.snapshot(&sid("ghost")).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_transcription_restores_buffer() {
        let c = controller(
            Arc::new(StubTranscriber::new(Err(ServiceError::Unavailable("refused".into())))),
            Arc::new(StubResponder::ok()),
            synth(),
        );
        let id = sid("s");
        c.upload_chunk(&id, b"AAAA").await.unwrap();

        match c.finalize_and_transcribe(&id).await {
            Err(PipelineError::Transcription { reason, .. }) => {
                assert_eq!(reason, TranscriptionReason::ServiceUnavailable)
            }
            other => panic!("unexpected {other:?}"),
        }
        let snap = c.snapshot(&id).await.unwrap();
        assert_eq!(snap.state, PipelineState::Collecting);
        assert_eq!(snap.buffered_bytes, 4);
    }

    #[tokio::test]
    async fn test_no_speech() {
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("   "))),
            Arc::new(StubResponder::ok()),
            synth(),
        );
        let id = sid("s");
        c.upload_chunk(&id, b"\0\0\0\0").await.unwrap();
        match c.finalize_and_transcribe(&id).await {
            Err(PipelineError::Transcription { reason, .. }) => {
                assert_eq!(reason, TranscriptionReason::NoSpeech)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_operations_are_not_found() {
        let c = happy();
        let id = c.start_session(Some(sid("s"))).await;

        assert!(matches!(
            c.advance_dialogue(&id).await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            c.synthesize_reply(&id, FormatRequest::native()).await,
            Err(PipelineError::NotFound(_))
        ));

        transcribed(&c, &id).await;
        assert!(matches!(
            c.synthesize_reply(&id, FormatRequest::native()).await,
            Err(PipelineError::NotFound(_))
        ));
        c.advance_dialogue(&id).await.unwrap();
        // The transcript was consumed by the round.
        assert!(matches!(
            c.advance_dialogue(&id).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_dialogue_leaves_history_and_state() {
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(StubResponder::failing_first(1)),
            synth(),
        );
        let id = sid("s");
        transcribed(&c, &id).await;

        let err = c.advance_dialogue(&id).await.unwrap_err();
        assert!(matches!(err, PipelineError::Dialogue(_)));
        assert!(err.is_transient());
        let snap = c.snapshot(&id).await.unwrap();
        assert!(snap.history.is_empty());
        assert_eq!(snap.state, PipelineState::Transcribed);

        // Retrying the same round succeeds and numbering starts at zero.
        c.advance_dialogue(&id).await.unwrap();
        let snap = c.snapshot(&id).await.unwrap();
        assert_eq!(snap.history.len(), 2);
        assert_eq!(snap.history[0].sequence, 0);
    }

    #[tokio::test]
    async fn test_concurrent_advance_is_rejected_as_busy() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(GatedResponder {
                entered: entered.clone(),
                release: release.clone(),
            }),
            synth(),
        );
        let id = sid("s");
        transcribed(&c, &id).await;

        let first = tokio::spawn({
            let c = c.clone();
            let id = id.clone();
            async move { c.advance_dialogue(&id).await }
        });
        entered.notified().await;

        assert!(matches!(
            c.advance_dialogue(&id).await,
            Err(PipelineError::SessionBusy(_))
        ));
        assert!(matches!(
            c.upload_chunk(&id, b"x").await,
            Err(PipelineError::SessionBusy(_))
        ));
        // Reads are not blocked by the in-flight call.
        assert_eq!(state(&c, &id).await, PipelineState::Transcribed);

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), "eventually");
        assert_eq!(c.snapshot(&id).await.unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(GatedResponder {
                entered: entered.clone(),
                release: release.clone(),
            }),
            synth(),
        );
        let a = sid("a");
        let b = sid("b");
        transcribed(&c, &a).await;

        let pending = tokio::spawn({
            let c = c.clone();
            let a = a.clone();
            async move { c.advance_dialogue(&a).await }
        });
        entered.notified().await;

        // Session b proceeds while a is waiting on its responder.
        transcribed(&c, &b).await;
        assert_eq!(state(&c, &b).await, PipelineState::Transcribed);
        assert_eq!(c.list_sessions().await.len(), 2);

        release.notify_one();
        pending.await.unwrap().unwrap();
        assert!(c.snapshot(&b).await.unwrap().history.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_timeout() {
        let c = controller(Arc::new(StalledTranscriber), Arc::new(StubResponder::ok()), synth());
        let id = sid("s");
        c.upload_chunk(&id, b"AAAA").await.unwrap();

        match c.finalize_and_transcribe(&id).await {
            Err(PipelineError::ServiceTimeout { stage, after }) => {
                assert_eq!(stage, Stage::Transcription);
                assert_eq!(after, Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(c.snapshot(&id).await.unwrap().buffered_bytes, 4);
    }

    #[tokio::test]
    async fn test_teardown_discards_in_flight_result() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(GatedResponder {
                entered: entered.clone(),
                release: release.clone(),
            }),
            synth(),
        );
        let id = sid("s");
        transcribed(&c, &id).await;

        let in_flight = tokio::spawn({
            let c = c.clone();
            let id = id.clone();
            async move { c.advance_dialogue(&id).await }
        });
        entered.notified().await;

        c.teardown(&id).await.unwrap();
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(PipelineError::NotFound(_))
        ));
        assert!(c.snapshot(&id).await.is_err());
        assert_eq!(c.session_count().await, 0);
        assert!(matches!(
            c.teardown(&id).await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let c = happy();
        let id = sid("s");
        transcribed(&c, &id).await;
        c.advance_dialogue(&id).await.unwrap();

        c.reset(&id).await.unwrap();
        let snap = c.snapshot(&id).await.unwrap();
        assert_eq!(snap.state, PipelineState::Idle);
        assert!(snap.history.is_empty());
        assert!(snap.last_reply.is_none());
    }

    #[tokio::test]
    async fn test_resynthesis_reuses_native_audio() {
        let synthesizer = synth();
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(StubResponder::ok()),
            synthesizer.clone(),
        );
        let id = sid("s");
        transcribed(&c, &id).await;
        c.advance_dialogue(&id).await.unwrap();

        let native = c.synthesize_reply(&id, FormatRequest::native()).await.unwrap();
        assert_eq!(native.format, AudioFormat::speech_16k());

        let wav = c.synthesize_reply(&id, FormatRequest::wav()).await.unwrap();
        assert_eq!(wav.container, AudioContainer::Wav);
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 1);

        // A bad target fails without disturbing the session.
        let bad = TargetFormat {
            sample_rate: 0,
            channels: 1,
            sample_width: 16,
            container: AudioContainer::Raw,
        };
        assert!(matches!(
            c.synthesize_reply(&id, bad.into()).await,
            Err(PipelineError::FormatConversion(_))
        ));
        assert_eq!(state(&c, &id).await, PipelineState::Synthesized);
    }

    #[tokio::test]
    async fn test_unusable_target_skips_synthesis() {
        let synthesizer = synth();
        let c = controller(
            Arc::new(StubTranscriber::new(Ok("hello"))),
            Arc::new(StubResponder::ok()),
            synthesizer.clone(),
        );
        let id = sid("s");
        transcribed(&c, &id).await;
        c.advance_dialogue(&id).await.unwrap();

        let oversized = FormatRequest {
            sample_rate: Some(u32::MAX),
            channels: Some(65_535),
            ..FormatRequest::default()
        };
        assert!(matches!(
            c.synthesize_reply(&id, oversized).await,
            Err(PipelineError::FormatConversion(_))
        ));
        assert_eq!(synthesizer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state(&c, &id).await, PipelineState::Responded);
    }

    #[tokio::test]
    async fn test_buffer_cap() {
        let c = Arc::new(
            PipelineController::new(
                Capabilities {
                    transcriber: Arc::new(StubTranscriber::new(Ok("hello"))),
                    responder: Arc::new(StubResponder::ok()),
                    synthesizer: synth(),
                },
                StageTimeouts::default(),
            )
            .with_max_buffer(6),
        );
        let id = sid("s");
        c.upload_chunk(&id, b"AAAA").await.unwrap();
        assert!(matches!(
            c.upload_chunk(&id, b"BBBB").await,
            Err(PipelineError::BufferFull { limit: 6 })
        ));
        assert_eq!(c.snapshot(&id).await.unwrap().buffered_bytes, 4);

        c.finalize_and_transcribe(&id).await.unwrap();
        assert_eq!(c.upload_chunk(&id, b"BBBBBB").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_teardown_mid_round_leaves_no_cache_behind() {
        let dir = tempfile::tempdir().unwrap();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let c = Arc::new(
            PipelineController::new(
                Capabilities {
                    transcriber: Arc::new(StubTranscriber::new(Ok("hello"))),
                    responder: Arc::new(GatedResponder {
                        entered: entered.clone(),
                        release: release.clone(),
                    }),
                    synthesizer: synth(),
                },
                StageTimeouts::default(),
            )
            .with_cache(Arc::new(FsArtifactCache::new(dir.path().to_path_buf()))),
        );
        let id = sid("doomed");
        transcribed(&c, &id).await;
        assert!(dir.path().join("doomed").exists());

        let in_flight = tokio::spawn({
            let c = c.clone();
            let id = id.clone();
            async move { c.advance_dialogue(&id).await }
        });
        entered.notified().await;

        c.teardown(&id).await.unwrap();
        release.notify_one();
        assert!(in_flight.await.unwrap().is_err());
        assert!(!dir.path().join("doomed").exists());
    }

    #[tokio::test]
    async fn test_artifacts_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(FsArtifactCache::new(dir.path().to_path_buf()));
        let c = PipelineController::new(
            Capabilities {
                transcriber: Arc::new(StubTranscriber::new(Ok("hello"))),
                responder: Arc::new(StubResponder::ok()),
                synthesizer: synth(),
            },
            StageTimeouts::default(),
        )
        .with_cache(cache.clone());

        let id = sid("cached");
        transcribed(&c, &id).await;
        c.advance_dialogue(&id).await.unwrap();
        c.synthesize_reply(&id, FormatRequest::native()).await.unwrap();

        let entries = cache.load(&id).await.unwrap();
        assert!(matches!(entries[0], CacheEntry::Transcript { .. }));
        assert_eq!(
            entries
                .iter()
                .filter(|e| matches!(e, CacheEntry::Turn { .. }))
                .count(),
            2
        );
        let audio = cache.load_audio(&id, 1).await.unwrap().unwrap();
        assert_eq!(audio.format, AudioFormat::speech_16k());

        c.teardown(&id).await.unwrap();
        assert!(cache.load(&id).await.unwrap().is_empty());
    }
}
