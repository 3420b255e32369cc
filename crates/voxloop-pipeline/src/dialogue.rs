use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use voxloop_core::error::{PipelineError, Result, ServiceError};
use voxloop_core::types::{ConversationTurn, Role, Stage};
use voxloop_providers::Responder;

use crate::bounded;

/// Ordered, committed conversation history of one session.
///
/// Sequence numbers are dense over committed turns: a failed round never
/// consumes one.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.turns.last().map(|t| t.sequence + 1).unwrap_or(0)
    }

    /// The most recent assistant turn, if any.
    pub fn last_reply(&self) -> Option<&ConversationTurn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }
}

/// Transcript → reply. The responder always sees the whole history.
pub struct DialogueStage {
    responder: Arc<dyn Responder>,
    timeout: Duration,
}

impl DialogueStage {
    pub fn new(responder: Arc<dyn Responder>, timeout: Duration) -> Self {
        Self { responder, timeout }
    }

    /// Run one dialogue round.
    ///
    /// On success the user and assistant turns are appended to
    /// `conversation` and returned. On failure `conversation` is untouched.
    pub async fn advance(
        &self,
        conversation: &mut Conversation,
        user_text: &str,
    ) -> Result<(ConversationTurn, ConversationTurn)> {
        let user = ConversationTurn::new(Role::User, user_text, conversation.next_sequence());
        let mut request = Vec::with_capacity(conversation.len() + 1);
        request.extend_from_slice(conversation.turns());
        request.push(user.clone());

        let start = Instant::now();
        let reply = bounded(Stage::Dialogue, self.timeout, self.responder.respond(&request))
            .await?
            .map_err(PipelineError::Dialogue)?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(PipelineError::Dialogue(ServiceError::Rejected(
                "empty reply".into(),
            )));
        }

        let assistant = ConversationTurn::new(Role::Assistant, reply, user.sequence + 1);
        conversation.turns.push(user.clone());
        conversation.turns.push(assistant.clone());

        debug!(
            responder = self.responder.id(),
            turns = conversation.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Dialogue round committed"
        );
        Ok((user, assistant))
    }
}
