use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One committed contribution to a session's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(role: Role, content: impl Into<String>, sequence: u64) -> Self {
        Self {
            role,
            content: content.into(),
            sequence,
            timestamp: Utc::now(),
        }
    }
}

/// Pipeline stage backed by an external capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcription,
    Dialogue,
    Synthesis,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transcription => "transcription",
            Self::Dialogue => "dialogue",
            Self::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sample format descriptor: rate in Hz, channel count, bits per sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16, sample_width: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_width,
        }
    }

    /// 16 kHz mono 16-bit, the usual speech-recognition input format.
    pub const fn speech_16k() -> Self {
        Self::new(16_000, 1, 16)
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.sample_width as usize).div_ceil(8)
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_sample() * self.channels as usize
    }

    /// Playback duration of `byte_len` bytes of raw PCM in this format.
    pub fn duration_ms(&self, byte_len: usize) -> u64 {
        let frame = self.bytes_per_frame();
        if frame == 0 || self.sample_rate == 0 {
            return 0;
        }
        (byte_len / frame) as u64 * 1000 / self.sample_rate as u64
    }
}

/// Byte layout of an audio payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioContainer {
    /// Headerless little-endian PCM.
    #[default]
    Raw,
    /// RIFF/WAVE with a PCM `fmt ` chunk.
    Wav,
}

impl AudioContainer {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Raw => "application/octet-stream",
            Self::Wav => "audio/wav",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Raw => "pcm",
            Self::Wav => "wav",
        }
    }
}

/// Synthesized or transcoded audio plus its format descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub format: AudioFormat,
    pub container: AudioContainer,
    pub data: Vec<u8>,
}

impl AudioPayload {
    pub fn raw(format: AudioFormat, data: Vec<u8>) -> Self {
        Self {
            format,
            container: AudioContainer::Raw,
            data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn default_target_width() -> u16 {
    16
}

/// Delivery format requested by a client for synthesized audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFormat {
    pub sample_rate: u32,
    pub channels: u16,
    #[serde(default = "default_target_width")]
    pub sample_width: u16,
    #[serde(default)]
    pub container: AudioContainer,
}

impl TargetFormat {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels, self.sample_width)
    }
}

/// Partially specified delivery format; unset fields keep the native value.
///
/// Doubles as the query string of audio download requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatRequest {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub sample_width: Option<u16>,
    pub container: Option<AudioContainer>,
}

impl FormatRequest {
    /// Deliver the synthesizer's output untouched.
    pub fn native() -> Self {
        Self::default()
    }

    /// Native sample format wrapped in a WAV container.
    pub fn wav() -> Self {
        Self {
            container: Some(AudioContainer::Wav),
            ..Self::default()
        }
    }

    pub fn is_native(&self) -> bool {
        *self == Self::default()
    }

    /// Fill unset fields from `native`.
    pub fn resolve(&self, native: AudioFormat) -> TargetFormat {
        TargetFormat {
            sample_rate: self.sample_rate.unwrap_or(native.sample_rate),
            channels: self.channels.unwrap_or(native.channels),
            sample_width: self.sample_width.unwrap_or(native.sample_width),
            container: self.container.unwrap_or_default(),
        }
    }
}

impl From<TargetFormat> for FormatRequest {
    fn from(target: TargetFormat) -> Self {
        Self {
            sample_rate: Some(target.sample_rate),
            channels: Some(target.channels),
            sample_width: Some(target.sample_width),
            container: Some(target.container),
        }
    }
}
