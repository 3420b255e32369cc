//! Opt-in durable cache of pipeline artifacts, keyed by session id and turn sequence.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::session::SessionId;
use crate::types::{AudioContainer, AudioFormat, AudioPayload, ConversationTurn};

/// A single line in a session's journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEntry {
    Transcript {
        text: String,
        timestamp: DateTime<Utc>,
    },
    Turn {
        turn: ConversationTurn,
    },
    Audio {
        sequence: u64,
        format: AudioFormat,
        container: AudioContainer,
        file: String,
        timestamp: DateTime<Utc>,
    },
    Reset {
        timestamp: DateTime<Utc>,
    },
}

/// Storage for intermediate artifacts. Never on the correctness path:
/// callers log failures and carry on.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    async fn append(&self, session: &SessionId, entry: &CacheEntry) -> Result<()>;

    /// Store synthesized audio for the assistant turn with the given sequence.
    async fn store_audio(&self, session: &SessionId, sequence: u64, audio: &AudioPayload)
    -> Result<()>;

    async fn load(&self, session: &SessionId) -> Result<Vec<CacheEntry>>;

    async fn load_audio(&self, session: &SessionId, sequence: u64) -> Result<Option<AudioPayload>>;

    async fn remove(&self, session: &SessionId) -> Result<()>;
}

/// File-based cache.
///
/// Layout:
/// - `<base>/<session>/journal.jsonl`: one [`CacheEntry`] per line
/// - `<base>/<session>/<sequence>.wav|pcm`: synthesized audio
pub struct FsArtifactCache {
    base: PathBuf,
}

impl FsArtifactCache {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn session_dir(&self, session: &SessionId) -> Result<PathBuf> {
        if !session.is_path_safe() {
            return Err(PipelineError::Other(anyhow::anyhow!(
                "session id {session:?} cannot be used as a cache key"
            )));
        }
        Ok(self.base.join(session.as_str()))
    }

    fn journal_path(&self, session: &SessionId) -> Result<PathBuf> {
        Ok(self.session_dir(session)?.join("journal.jsonl"))
    }
}

#[async_trait]
impl ArtifactCache for FsArtifactCache {
    async fn append(&self, session: &SessionId, entry: &CacheEntry) -> Result<()> {
        let dir = self.session_dir(session)?;
        tokio::fs::create_dir_all(&dir).await?;

        let line = serde_json::to_string(entry)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path(session)?)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn store_audio(
        &self,
        session: &SessionId,
        sequence: u64,
        audio: &AudioPayload,
    ) -> Result<()> {
        let dir = self.session_dir(session)?;
        tokio::fs::create_dir_all(&dir).await?;

        let file = format!("{sequence}.{}", audio.container.extension());
        let path = dir.join(&file);
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &audio.data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.append(
            session,
            &CacheEntry::Audio {
                sequence,
                format: audio.format,
                container: audio.container,
                file,
                timestamp: Utc::now(),
            },
        )
        .await?;

        debug!(%session, sequence, bytes = audio.data.len(), "Cached synthesized audio");
        Ok(())
    }

    async fn load(&self, session: &SessionId) -> Result<Vec<CacheEntry>> {
        let path = self.journal_path(session)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: CacheEntry = serde_json::from_str(line).map_err(|e| {
                PipelineError::Other(anyhow::anyhow!("corrupt cache journal line: {e}"))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn load_audio(&self, session: &SessionId, sequence: u64) -> Result<Option<AudioPayload>> {
        // The latest audio entry for a sequence wins.
        let found = self.load(session).await?.into_iter().rev().find_map(|e| match e {
            CacheEntry::Audio {
                sequence: s,
                format,
                container,
                file,
                ..
            } if s == sequence => Some((format, container, file)),
            _ => None,
        });

        let Some((format, container, file)) = found else {
            return Ok(None);
        };
        let path = self.session_dir(session)?.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read(&path).await?;
        Ok(Some(AudioPayload {
            format,
            container,
            data,
        }))
    }

    async fn remove(&self, session: &SessionId) -> Result<()> {
        let dir = self.session_dir(session)?;
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        debug!(%session, "Removed cached artifacts");
        Ok(())
    }
}
