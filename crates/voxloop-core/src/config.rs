//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{AudioFormat, Stage};

/// Top-level voxloop configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder: Option<ResponderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Session used by the device-compatible routes (`/upload`, `/get_response`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_session: Option<String>,
}

fn default_port() -> u16 {
    5000
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// Provider: "groq", "openai" or "command" (default: "groq").
    #[serde(default = "default_transcription_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Model name (e.g. "whisper-large-v3-turbo").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Override the provider's API base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// ISO 639-1 language hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Program to run for the "command" provider. `{input}` in `args` is
    /// replaced with the path of the finalized audio file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Format of raw PCM uploads (default: 16 kHz mono 16-bit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_format: Option<AudioFormat>,
}

fn default_transcription_provider() -> String {
    "groq".into()
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_transcription_provider(),
            api_key: None,
            api_key_env: None,
            model: None,
            base_url: None,
            language: None,
            command: None,
            args: Vec::new(),
            input_format: None,
        }
    }
}

/// Conversational model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Provider: "ollama", "openai" or "openrouter" (default: "ollama").
    #[serde(default = "default_responder_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// System prompt prepended to every request (e.g. "Keep answers short.").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

fn default_responder_provider() -> String {
    "ollama".into()
}

impl ResponderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            provider: default_responder_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            model: None,
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Provider: "cosyvoice" or "elevenlabs" (default: "cosyvoice").
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Voice / speaker id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Native output rate of the synthesizer, when it is configurable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

fn default_tts_provider() -> String {
    "cosyvoice".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            voice: None,
            model: None,
            sample_rate: None,
        }
    }
}

/// Per-stage timeouts, in seconds, and the per-session buffer cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub responder_timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_timeout_secs: Option<u64>,

    /// Most audio bytes a session may buffer before finalizing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffer_bytes: Option<usize>,
}

/// Opt-in durable cache of transcripts, turns, and synthesized audio.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cache directory (default: `~/.voxloop/cache`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxloop_pipeline=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

const TRANSCRIPTION_PROVIDERS: &[&str] = &["groq", "openai", "command"];
const RESPONDER_PROVIDERS: &[&str] = &["ollama", "openai", "openrouter"];
const TTS_PROVIDERS: &[&str] = &["cosyvoice", "elevenlabs"];

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted)
            .map_err(|e| crate::error::PipelineError::Config(e.to_string()))
    }

    /// Default config file location: `~/.voxloop/config.json`
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(5000)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    /// Session id served by the device-compatible routes.
    pub fn default_session(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.default_session.clone())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Timeout applied to every call into the given stage's capability.
    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        let p = self.pipeline.as_ref();
        let secs = match stage {
            Stage::Transcription => p.and_then(|p| p.transcription_timeout_secs).unwrap_or(30),
            Stage::Dialogue => p.and_then(|p| p.responder_timeout_secs).unwrap_or(60),
            Stage::Synthesis => p.and_then(|p| p.synthesis_timeout_secs).unwrap_or(60),
        };
        Duration::from_secs(secs)
    }

    /// Per-session upload buffer cap (default 32 MiB).
    pub fn max_buffer_bytes(&self) -> usize {
        self.pipeline
            .as_ref()
            .and_then(|p| p.max_buffer_bytes)
            .unwrap_or(32 * 1024 * 1024)
    }

    /// Cache directory when the artifact cache is enabled.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        let cache = self.cache.as_ref().filter(|c| c.enabled)?;
        Some(
            cache
                .dir
                .as_ref()
                .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
                .unwrap_or_else(|| data_dir().join("cache")),
        )
    }

    /// Get a config value by dotted path (e.g. "gateway.port", "responder.model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
        }

        let stt = self.transcription.clone().unwrap_or_default();
        if !TRANSCRIPTION_PROVIDERS.contains(&stt.provider.as_str()) {
            errors.push(format!("Unknown transcription provider '{}'", stt.provider));
        } else if stt.provider == "command" {
            if stt.command.as_deref().is_none_or(str::is_empty) {
                errors.push("Transcription provider 'command' requires transcription.command".into());
            }
        } else if stt.resolve_api_key().is_none() {
            warnings.push(format!(
                "Transcription provider '{}' has no API key configured",
                stt.provider
            ));
        }

        let responder = self.responder.clone().unwrap_or_default();
        if !RESPONDER_PROVIDERS.contains(&responder.provider.as_str()) {
            errors.push(format!("Unknown responder provider '{}'", responder.provider));
        } else if responder.provider != "ollama" && responder.resolve_api_key().is_none() {
            warnings.push(format!(
                "Responder provider '{}' has no API key configured",
                responder.provider
            ));
        }

        let tts = self.tts.clone().unwrap_or_default();
        if !TTS_PROVIDERS.contains(&tts.provider.as_str()) {
            errors.push(format!("Unknown TTS provider '{}'", tts.provider));
        } else if tts.provider == "elevenlabs" && tts.resolve_api_key().is_none() {
            warnings.push("TTS provider 'elevenlabs' has no API key configured".into());
        }

        for stage in [Stage::Transcription, Stage::Dialogue, Stage::Synthesis] {
            if self.stage_timeout(stage).is_zero() {
                errors.push(format!("Timeout for the {stage} stage cannot be 0"));
            }
        }
        if self.max_buffer_bytes() == 0 {
            errors.push("pipeline.max_buffer_bytes cannot be 0".into());
        }

        (warnings, errors)
    }
}

/// Base directory for voxloop data: `~/.voxloop/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxloop")
}
