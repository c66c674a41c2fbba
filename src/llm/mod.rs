//! Talking to an OpenAI-compatible chat-completions endpoint.

pub mod client;
pub mod prompts;
mod stream;

pub use client::{ClientSettings, OpenAiClient};

use crate::conversation::{Message, ToolCall};
use crate::tools::ToolDefinition;
use std::future::Future;
use thiserror::Error;

/// One complete assistant response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssistantReply {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AssistantReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content,
            tool_calls,
        }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Transient(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("authentication failed: {0}. Run `craft-code configure` to set an API key.")]
    Auth(String),
    #[error("could not parse the model response: {0}")]
    Parse(String),
    #[error("request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

/// Anything that can answer a chat-completions request.
pub trait ChatBackend: Send + Sync {
    fn complete<'a>(
        &'a self,
        messages: &'a [Message],
        tools: &'a [ToolDefinition],
    ) -> impl Future<Output = Result<AssistantReply, LlmError>> + Send + 'a;
}
