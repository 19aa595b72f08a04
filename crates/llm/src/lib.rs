//! AppForge LLM
//!
//! Model-inference abstraction for the AppForge workspace. Defines the
//! provider-agnostic message/usage/tool types, the `InferenceProvider` trait
//! with cooperative cancellation, and an OpenAI-compatible HTTP provider
//! with SSE streaming.
//!
//! Retry policy lives inside providers; the orchestrator core only
//! distinguishes `LlmError::RateLimited` (surfaced to clients as a
//! `rate_limit_error` event) from everything else.

pub mod openai;
pub mod provider;
pub mod types;

pub use openai::{OpenAiCompatProvider, ProviderConfig};
pub use provider::{parse_http_error, InferenceProvider};
pub use types::{
    LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message, MessageRole, ToolCall,
    ToolDefinition, UsageStats,
};
