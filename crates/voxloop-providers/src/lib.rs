//! Conversational model abstraction.
//!
//! A [`Responder`] takes the full ordered conversation history and returns
//! the assistant's next reply. [`ChatResponder`] covers every
//! OpenAI-compatible Chat Completions endpoint.

use std::sync::Arc;

use async_trait::async_trait;

use voxloop_core::config::Config;
use voxloop_core::error::ServiceError;
use voxloop_core::types::ConversationTurn;

pub mod chat;
pub mod sse;

pub use chat::{ApiStyle, ChatResponder};

#[async_trait]
pub trait Responder: Send + Sync {
    /// Provider identifier (e.g., "ollama", "openai").
    fn id(&self) -> &str;

    /// Produce the reply to the last user turn in `history`.
    async fn respond(&self, history: &[ConversationTurn]) -> Result<String, ServiceError>;
}

/// Build the responder selected by `responder.provider`.
pub fn build_responder(config: &Config) -> anyhow::Result<Arc<dyn Responder>> {
    let responder = config.responder.clone().unwrap_or_default();
    let style = ApiStyle::from_provider(&responder.provider)
        .ok_or_else(|| anyhow::anyhow!("Unknown responder provider: {}", responder.provider))?;
    Ok(Arc::new(ChatResponder::new(style, &responder)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxloop_core::config::ResponderConfig;

    #[test]
    fn test_build_responder() {
        assert_eq!(build_responder(&Config::default()).unwrap().id(), "ollama");

        let config = Config {
            responder: Some(ResponderConfig {
                provider: "openrouter".into(),
                ..ResponderConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(build_responder(&config).unwrap().id(), "openrouter");

        let config = Config {
            responder: Some(ResponderConfig {
                provider: "bard".into(),
                ..ResponderConfig::default()
            }),
            ..Config::default()
        };
        assert!(build_responder(&config).is_err());
    }
}
