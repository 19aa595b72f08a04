//! Inference Types
//!
//! Provider-agnostic message, tool, and usage types plus the inference
//! error taxonomy.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a model conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Tool name, set on `Tool` role messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Id of the tool call a `Tool` role message responds to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            name: Some(name.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON string of arguments as emitted by the model.
    pub arguments: String,
}

/// Definition of a tool offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input.
    pub parameters: Value,
}

/// Token accounting across one or more inference calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl UsageStats {
    pub fn add(&mut self, other: UsageStats) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }

    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Per-request tuning knobs.
#[derive(Debug, Clone, Default)]
pub struct LlmRequestOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A complete model response.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: UsageStats,
    pub stop_reason: Option<String>,
}

/// Inference error taxonomy.
///
/// `RateLimited` is the only variant the orchestrator treats specially: it
/// aborts the current state-machine run and reaches the client as a
/// `rate_limit_error` event. Everything else surfaces as a generic `error`.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u32>,
    },

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Server error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ServerError {
        message: String,
        status: Option<u16>,
    },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Parse error: {message}")]
    ParseError { message: String },

    #[error("Inference cancelled")]
    Cancelled,

    #[error("{message}")]
    Other { message: String },
}

/// Result type alias for inference errors
pub type LlmResult<T> = Result<T, LlmError>;

impl LlmError {
    /// Whether this error should abort the whole state-machine run rather
    /// than the current operation only.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = Message::user("build a todo app");
        assert_eq!(msg.role, MessageRole::User);
        assert!(msg.tool_calls.is_none());

        let tool = Message::tool_result("tc-1", "read_files", "{}");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("tc-1"));
    }

    #[test]
    fn test_message_serialization_skips_empty() {
        let json = serde_json::to_string(&Message::assistant("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }

    #[test]
    fn test_usage_accumulation() {
        let mut usage = UsageStats::default();
        usage.add(UsageStats {
            input_tokens: 100,
            output_tokens: 20,
        });
        usage.add(UsageStats {
            input_tokens: 50,
            output_tokens: 5,
        });
        assert_eq!(usage.total(), 175);
    }

    #[test]
    fn test_rate_limit_classification() {
        let err = LlmError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(30),
        };
        assert!(err.is_rate_limit());
        assert!(!LlmError::Cancelled.is_rate_limit());
    }

    #[test]
    fn test_server_error_display() {
        let err = LlmError::ServerError {
            message: "upstream".to_string(),
            status: Some(503),
        };
        assert_eq!(err.to_string(), "Server error (503): upstream");
    }
}
