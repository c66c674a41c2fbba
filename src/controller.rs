//! The request/response loop between the user, the model and the tools.
//!
//! One user input drives up to `max_turns` requests. Tool calls from a reply
//! run one at a time in the order issued; their messages are staged and only
//! appended once the whole batch has a result, so the history never holds an
//! assistant tool-call message without its answers.

use crate::conversation::{Conversation, Message, Role, ToolCall, ToolResult};
use crate::dispatch::Dispatcher;
use crate::format::ResultFormatter;
use crate::llm::{prompts, ChatBackend, LlmError};
use crate::tools::{get_tool_definitions, ToolDefinition};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Conversation state for one interactive session.
#[derive(Debug, Clone)]
pub struct Session {
    conversation: Conversation,
    next_call_seq: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(prompts::SYSTEM_PROMPT)
    }
}

impl Session {
    pub fn new(system_prompt: &str) -> Self {
        Self {
            conversation: Conversation::with_system_prompt(system_prompt),
            next_call_seq: 0,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Give tool calls without an id a session-unique one.
    fn assign_call_ids(&mut self, calls: &mut [ToolCall]) {
        for call in calls {
            if call.id.trim().is_empty() {
                self.next_call_seq += 1;
                call.id = format!("call_{}", self.next_call_seq);
            }
        }
    }
}

/// Progress reported while a turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Text the model sent alongside tool calls.
    AssistantText(String),
    ToolStarted(ToolCall),
    ToolFinished { call: ToolCall, result: ToolResult },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Answer(String),
    /// The model was still calling tools after this many requests.
    TurnLimit { turns: usize },
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("model request failed: {0}")]
    Network(#[from] LlmError),
    #[error("turn cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

pub struct Controller<B> {
    backend: B,
    dispatcher: Dispatcher,
    formatter: ResultFormatter,
    tools: Vec<ToolDefinition>,
    max_turns: usize,
}

impl<B: ChatBackend> Controller<B> {
    pub fn new(
        backend: B,
        dispatcher: Dispatcher,
        formatter: ResultFormatter,
        max_turns: usize,
    ) -> Self {
        Self {
            backend,
            dispatcher,
            formatter,
            tools: get_tool_definitions(),
            max_turns: max_turns.max(1),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Handle one user input until the model answers, the turn limit is hit,
    /// or an error aborts it. The conversation stays valid in every case.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        input: &str,
        cancel: &CancellationToken,
        on_event: &mut dyn FnMut(TurnEvent),
    ) -> Result<TurnOutcome, TurnError> {
        session.conversation.push(Message::user(input));

        for turn in 1..=self.max_turns {
            debug!(turn, messages = session.conversation.len(), "requesting completion");
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                reply = self.backend.complete(session.conversation.messages(), &self.tools) => reply,
            };
            let mut reply = match reply {
                Ok(reply) => reply,
                Err(LlmError::Cancelled) => return Err(TurnError::Cancelled),
                Err(err) => return Err(TurnError::Network(err)),
            };

            if reply.tool_calls.is_empty() {
                let answer = reply.content.unwrap_or_default();
                session.conversation.push(Message::assistant(answer.clone()));
                return Ok(TurnOutcome::Answer(answer));
            }

            session.assign_call_ids(&mut reply.tool_calls);
            if let Some(text) = reply.content.as_deref().filter(|t| !t.trim().is_empty()) {
                on_event(TurnEvent::AssistantText(text.to_string()));
            }

            let staged = self.run_batch(reply.content, reply.tool_calls, cancel, on_event).await?;
            session.conversation.extend(staged);

            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
        }

        Ok(TurnOutcome::TurnLimit {
            turns: self.max_turns,
        })
    }

    /// Run `calls` in order and return the assistant message plus one tool
    /// message per call. Calls left over after a cancellation are answered
    /// without being run.
    async fn run_batch(
        &self,
        content: Option<String>,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
        on_event: &mut dyn FnMut(TurnEvent),
    ) -> Result<Vec<Message>, TurnError> {
        let mut staged = Vec::with_capacity(calls.len() + 1);
        staged.push(Message::assistant_tool_calls(content, calls.clone()));

        for call in calls {
            let result = if cancel.is_cancelled() {
                ToolResult::error(&call.id, "Not run: the user cancelled the turn.")
            } else {
                on_event(TurnEvent::ToolStarted(call.clone()));
                let dispatcher = self.dispatcher.clone();
                let owned = call.clone();
                let dispatch = tokio::task::spawn_blocking(move || dispatcher.dispatch(&owned))
                    .await
                    .map_err(|e| {
                        error!(call_id = %call.id, "tool dispatch panicked: {e}");
                        TurnError::Internal(format!("dispatch of {} failed: {e}", call.name))
                    })?;
                debug_assert!(dispatch.final_state().is_terminal());
                self.formatter.bound(dispatch.result)
            };

            staged.push(self.formatter.to_message(&result));
            on_event(TurnEvent::ToolFinished { call, result });
        }

        debug_assert_eq!(
            staged.iter().filter(|m| m.role == Role::Tool).count() + 1,
            staged.len()
        );
        Ok(staged)
    }
}
