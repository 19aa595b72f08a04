//! Inference Provider Trait
//!
//! Defines the common interface implemented by all model backends.
//! Every call takes a `CancellationToken`; nested operations are expected
//! to reuse their parent's token so one `stop` cancels a whole run.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::{
    LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message, ToolDefinition,
};

/// Trait that all inference providers implement.
///
/// Provides a unified interface for:
/// - Complete responses (`complete`)
/// - Streamed responses (`stream`) delivering raw text deltas over a channel
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Provider name for identification and logging.
    fn name(&self) -> &'static str;

    /// The model currently in use.
    fn model(&self) -> &str;

    /// The model's context window size in tokens. Default: 128,000.
    fn context_window(&self) -> u32 {
        128_000
    }

    /// Send a conversation and get a complete response.
    async fn complete(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        tools: Vec<ToolDefinition>,
        options: LlmRequestOptions,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse>;

    /// Stream a response. Text deltas are sent over `chunks` as they arrive;
    /// the accumulated final response is returned once the stream ends.
    ///
    /// Cancellation is cooperative: bytes already received are discarded and
    /// `LlmError::Cancelled` is returned.
    async fn stream(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        tools: Vec<ToolDefinition>,
        options: LlmRequestOptions,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse>;
}

/// Map an HTTP status + body from a provider endpoint to a typed error.
pub fn parse_http_error(status: u16, body: &str, provider: &str) -> LlmError {
    match status {
        401 | 403 => LlmError::AuthenticationFailed {
            message: format!("{provider}: access denied"),
        },
        404 => LlmError::ModelNotFound {
            model: body.to_string(),
        },
        429 => LlmError::RateLimited {
            message: body.to_string(),
            retry_after: None,
        },
        400 => LlmError::InvalidRequest {
            message: body.to_string(),
        },
        500..=599 => LlmError::ServerError {
            message: body.to_string(),
            status: Some(status),
        },
        _ => LlmError::Other {
            message: format!("HTTP {status}: {body}"),
        },
    }
}
