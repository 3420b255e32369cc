//! Media layer: speech capabilities, WAV containers and transcoding.

mod http;
pub mod stt;
pub mod transcode;
pub mod tts;
pub mod wav;

pub use stt::{Transcriber, build_transcriber};
pub use transcode::transcode;
pub use tts::{Synthesizer, build_synthesizer};
