//! Text-to-speech capabilities. Both adapters stream raw PCM from the
//! provider and collect it into a single payload.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;

use voxloop_core::config::{Config, TtsConfig};
use voxloop_core::error::ServiceError;
use voxloop_core::types::{AudioFormat, AudioPayload};

use crate::http::{check_status, send_error};

/// Turns reply text into audio in the synthesizer's native format.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Native output format, known before any call is made.
    fn native_format(&self) -> AudioFormat;

    async fn synthesize(&self, text: &str) -> Result<AudioPayload, ServiceError>;
}

/// Drain a streaming PCM response, dropping a trailing partial frame.
async fn collect_pcm(
    resp: reqwest::Response,
    format: AudioFormat,
) -> Result<AudioPayload, ServiceError> {
    let mut stream = resp.bytes_stream();
    let mut pcm = Vec::new();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| ServiceError::Unavailable(format!("TTS stream error: {e}")))?;
        pcm.extend_from_slice(&bytes);
    }

    let frame = format.bytes_per_frame().max(1);
    pcm.truncate(pcm.len() - pcm.len() % frame);
    if pcm.is_empty() {
        return Err(ServiceError::Rejected("synthesizer returned no audio".into()));
    }
    Ok(AudioPayload::raw(format, pcm))
}

/// CosyVoice SFT inference server (`/inference_sft`), int16 mono.
pub struct CosyVoiceSynthesizer {
    client: reqwest::Client,
    base_url: String,
    speaker: String,
    format: AudioFormat,
}

impl CosyVoiceSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:50000".into()),
            speaker: config.voice.clone().unwrap_or_else(|| "中文女".into()),
            format: AudioFormat::new(config.sample_rate.unwrap_or(22_050), 1, 16),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/inference_sft", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Synthesizer for CosyVoiceSynthesizer {
    fn name(&self) -> &str {
        "cosyvoice"
    }

    fn native_format(&self) -> AudioFormat {
        self.format
    }

    async fn synthesize(&self, text: &str) -> Result<AudioPayload, ServiceError> {
        let url = self.endpoint();
        debug!(url, speaker = %self.speaker, text_len = text.len(), "Requesting CosyVoice synthesis");

        let resp = self
            .client
            .get(&url)
            .form(&[("tts_text", text), ("spk_id", self.speaker.as_str())])
            .send()
            .await
            .map_err(send_error)?;
        let resp = check_status(resp).await?;
        collect_pcm(resp, self.format).await
    }
}

/// ElevenLabs streaming endpoint with raw PCM output.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    voice: String,
    model: String,
    format: AudioFormat,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: &TtsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.resolve_api_key(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.elevenlabs.io".into()),
            voice: config.voice.clone().unwrap_or_else(|| "Rachel".into()),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "eleven_turbo_v2".into()),
            format: AudioFormat::new(config.sample_rate.unwrap_or(16_000), 1, 16),
        }
    }

    /// Streaming request URL for the configured voice.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream?output_format=pcm_{}",
            self.base_url.trim_end_matches('/'),
            self.voice,
            self.format.sample_rate
        )
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    fn native_format(&self) -> AudioFormat {
        self.format
    }

    async fn synthesize(&self, text: &str) -> Result<AudioPayload, ServiceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ServiceError::Rejected("no TTS API key configured".into()))?;

        let url = self.endpoint();
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await
            .map_err(send_error)?;
        let resp = check_status(resp).await?;
        collect_pcm(resp, self.format).await
    }
}

/// Build the synthesizer selected by `tts.provider`.
pub fn build_synthesizer(config: &Config) -> anyhow::Result<Arc<dyn Synthesizer>> {
    let tts = config.tts.clone().unwrap_or_default();
    match tts.provider.as_str() {
        "cosyvoice" => Ok(Arc::new(CosyVoiceSynthesizer::new(&tts))),
        "elevenlabs" => Ok(Arc::new(ElevenLabsSynthesizer::new(&tts))),
        other => anyhow::bail!("Unknown TTS provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosyvoice_defaults() {
        let tts = CosyVoiceSynthesizer::new(&TtsConfig::default());
        assert_eq!(tts.endpoint(), "http://localhost:50000/inference_sft");
        assert_eq!(tts.speaker, "中文女");
        assert_eq!(tts.native_format(), AudioFormat::new(22_050, 1, 16));
    }

    #[test]
    fn test_elevenlabs_request_construction() {
        let tts = ElevenLabsSynthesizer::new(&TtsConfig {
            provider: "elevenlabs".into(),
            voice: Some("Rachel".into()),
            ..TtsConfig::default()
        });
        let url = tts.endpoint();
        assert!(url.starts_with("https://api.elevenlabs.io/v1/text-to-speech/Rachel/stream"));
        assert!(url.ends_with("output_format=pcm_16000"));
        assert_eq!(tts.native_format(), AudioFormat::speech_16k());
    }

    #[tokio::test]
    async fn test_elevenlabs_without_key_is_rejected() {
        let tts = ElevenLabsSynthesizer::new(&TtsConfig {
            provider: "elevenlabs".into(),
            api_key_env: Some("VX_TEST_UNSET_TTS_KEY".into()),
            ..TtsConfig::default()
        });
        assert!(matches!(
            tts.synthesize("hi").await,
            Err(ServiceError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        // Port 9 (discard) is closed on test machines; connection refused.
        let tts = CosyVoiceSynthesizer::new(&TtsConfig {
            base_url: Some("http://127.0.0.1:9".into()),
            ..TtsConfig::default()
        });
        let err = tts.synthesize("你好").await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }

    #[test]
    fn test_build_synthesizer() {
        assert_eq!(build_synthesizer(&Config::default()).unwrap().name(), "cosyvoice");
        let config = Config {
            tts: Some(TtsConfig {
                provider: "festival".into(),
                ..TtsConfig::default()
            }),
            ..Config::default()
        };
        assert!(build_synthesizer(&config).is_err());
    }
}
