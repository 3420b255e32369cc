//! OpenAI-compatible Chat Completions responder.
//!
//! Streams `/v1/chat/completions` and accumulates the content deltas into a
//! single reply. Serves OpenAI, OpenRouter and Ollama.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use voxloop_core::config::ResponderConfig;
use voxloop_core::error::ServiceError;
use voxloop_core::types::ConversationTurn;

use crate::Responder;
use crate::sse::{SseEvent, parse_sse_stream};

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api";
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// API style. Determines auth and the default endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStyle {
    OpenAi,
    OpenRouter,
    Ollama,
}

impl ApiStyle {
    pub fn from_provider(provider: &str) -> Option<Self> {
        match provider {
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    fn id(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Ollama => "ollama",
        }
    }

    fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => OPENAI_BASE_URL,
            Self::OpenRouter => OPENROUTER_BASE_URL,
            Self::Ollama => OLLAMA_BASE_URL,
        }
    }

    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAi => "gpt-4o-mini",
            Self::OpenRouter => "meta-llama/llama-3.1-8b-instruct",
            Self::Ollama => "llama3.1",
        }
    }
}

pub struct ChatResponder {
    pub base_url: String,
    pub api_style: ApiStyle,
    pub model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl ChatResponder {
    pub fn new(style: ApiStyle, config: &ResponderConfig) -> Self {
        Self {
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(style.default_base_url())
                .trim_end_matches('/')
                .to_string(),
            api_style: style,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| style.default_model().to_string()),
            api_key: config.resolve_api_key(),
            system_prompt: config.system_prompt.clone().filter(|s| !s.is_empty()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client: reqwest::Client::new(),
        }
    }

    /// System prompt (if any) followed by the whole history, in order.
    fn format_messages(&self, history: &[ConversationTurn]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(
            history
                .iter()
                .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content })),
        );
        messages
    }

    fn build_request(&self, history: &[ConversationTurn]) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: self.format_messages(history),
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

// --- Chat Completions request/response types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Accumulate content deltas until `[DONE]` or end of stream.
async fn collect_reply<S>(events: S) -> Result<String, ServiceError>
where
    S: Stream<Item = anyhow::Result<SseEvent>>,
{
    tokio::pin!(events);
    let mut reply = String::new();

    while let Some(event) = events.next().await {
        let event = event.map_err(|e| ServiceError::Unavailable(e.to_string()))?;
        let data = event.data.trim();
        if data == "[DONE]" {
            break;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(%e, data, "Skipping unparseable chunk");
                continue;
            }
        };
        if let Some(content) = chunk.choices.first().and_then(|c| c.delta.content.as_deref()) {
            reply.push_str(content);
        }
    }

    let reply = reply.trim();
    if reply.is_empty() {
        return Err(ServiceError::Rejected("model returned an empty reply".into()));
    }
    Ok(reply.to_string())
}

#[async_trait]
impl Responder for ChatResponder {
    fn id(&self) -> &str {
        self.api_style.id()
    }

    async fn respond(&self, history: &[ConversationTurn]) -> Result<String, ServiceError> {
        let body = self.build_request(history);
        debug!(model = %body.model, base_url = %self.base_url, turns = history.len(), "Streaming chat completion");

        let mut req = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);

        match (&self.api_key, self.api_style) {
            (Some(key), _) => req = req.bearer_auth(key),
            (None, ApiStyle::Ollama) => {}
            (None, style) => {
                return Err(ServiceError::Rejected(format!(
                    "no API key configured for {}",
                    style.id()
                )));
            }
        }
        if self.api_style == ApiStyle::OpenRouter {
            req = req.header("HTTP-Referer", "https://github.com/Clemens865/voxloop");
        }

        let response = req.send().await.map_err(|e| {
            if e.is_builder() {
                ServiceError::Rejected(e.to_string())
            } else {
                ServiceError::Unavailable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, &body));
        }

        collect_reply(parse_sse_stream(response)).await
    }
}
