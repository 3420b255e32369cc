//! Speech-to-text capabilities.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use voxloop_core::config::{Config, TranscriptionConfig};
use voxloop_core::error::ServiceError;
use voxloop_core::types::AudioFormat;

use crate::http::{check_status, send_error};
use crate::wav;

/// Turns a finalized audio buffer into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe a complete utterance. Returns [`ServiceError::NoSpeech`]
    /// when nothing intelligible was heard.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, ServiceError>;
}

/// Pass WAV uploads through; wrap anything else as raw PCM in `format`.
fn ensure_wav(audio: &[u8], format: AudioFormat) -> Result<Vec<u8>, ServiceError> {
    if wav::is_wav(audio) {
        return Ok(audio.to_vec());
    }
    wav::encode(audio, format).map_err(|e| ServiceError::Rejected(format!("invalid audio: {e}")))
}

fn non_empty(text: &str) -> Result<String, ServiceError> {
    let text = text.trim();
    if text.is_empty() {
        Err(ServiceError::NoSpeech)
    } else {
        Ok(text.to_string())
    }
}

/// OpenAI-compatible `/audio/transcriptions` client (Groq, OpenAI).
pub struct WhisperTranscriber {
    client: reqwest::Client,
    provider: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    language: Option<String>,
    input_format: AudioFormat,
}

impl WhisperTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Self {
        let (base_url, model) = match config.provider.as_str() {
            "openai" => ("https://api.openai.com/v1", "whisper-1"),
            _ => ("https://api.groq.com/openai/v1", "whisper-large-v3-turbo"),
        };
        Self {
            client: reqwest::Client::new(),
            provider: config.provider.clone(),
            api_key: config.resolve_api_key(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| base_url.to_string()),
            model: config.model.clone().unwrap_or_else(|| model.to_string()),
            language: config.language.clone(),
            input_format: config.input_format.unwrap_or(AudioFormat::speech_16k()),
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/audio/transcriptions",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, ServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::Rejected("no transcription API key configured".into()))?;

        let wav_data = ensure_wav(audio, self.input_format)?;
        let url = self.endpoint();
        debug!(url, model = %self.model, wav_bytes = wav_data.len(), "Sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(send_error)?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await
            .map_err(send_error)?;
        let resp = check_status(resp).await?;

        let text = resp.text().await.map_err(send_error)?;
        non_empty(&text)
    }
}

/// Runs an external recognizer. The audio is written to a temporary WAV
/// file; the transcript is whatever the program prints on stdout.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    input_format: AudioFormat,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>, input_format: AudioFormat) -> Self {
        Self {
            program: program.into(),
            args,
            input_format,
        }
    }

    /// Substitute `{input}` in the arguments, or append the path if no
    /// argument mentions it.
    fn command_args(&self, input: &str) -> Vec<String> {
        if self.args.iter().any(|a| a.contains("{input}")) {
            self.args
                .iter()
                .map(|a| a.replace("{input}", input))
                .collect()
        } else {
            let mut args = self.args.clone();
            args.push(input.to_string());
            args
        }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    fn name(&self) -> &str {
        "command"
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<String, ServiceError> {
        let wav_data = ensure_wav(audio, self.input_format)?;

        let file = tempfile::Builder::new()
            .prefix("voxloop-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| ServiceError::Unavailable(format!("temp file: {e}")))?;
        tokio::fs::write(file.path(), &wav_data)
            .await
            .map_err(|e| ServiceError::Unavailable(format!("temp file: {e}")))?;

        let input = file.path().to_string_lossy().into_owned();
        let args = self.command_args(&input);
        debug!(program = %self.program, ?args, "Running transcription command");

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("failed to run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        non_empty(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Build the transcriber selected by `transcription.provider`.
pub fn build_transcriber(config: &Config) -> anyhow::Result<Arc<dyn Transcriber>> {
    let stt = config.transcription.clone().unwrap_or_default();
    match stt.provider.as_str() {
        "groq" | "openai" => Ok(Arc::new(WhisperTranscriber::new(&stt))),
        "command" => {
            let program = stt
                .command
                .clone()
                .filter(|c| !c.is_empty())
                .ok_or_else(|| anyhow::anyhow!("transcription.command is required for the command provider"))?;
            Ok(Arc::new(CommandTranscriber::new(
                program,
                stt.args.clone(),
                stt.input_format.unwrap_or(AudioFormat::speech_16k()),
            )))
        }
        other => anyhow::bail!("Unknown transcription provider: {other}"),
    }
}
