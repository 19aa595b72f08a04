//! OpenAI-Compatible Provider
//!
//! HTTP provider for any endpoint speaking the OpenAI chat-completions
//! dialect. Streaming uses server-sent events; each `data:` line carries a
//! delta that is forwarded as a raw text chunk.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::provider::{parse_http_error, InferenceProvider};
use crate::types::{
    LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message, MessageRole, ToolCall,
    ToolDefinition, UsageStats,
};

/// Configuration for an OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1` or a gateway URL.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    /// Context window used to derive operation budgets.
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_context_window() -> u32 {
    128_000
}

fn default_timeout_secs() -> u64 {
    300
}

/// Provider speaking the OpenAI chat-completions dialect.
pub struct OpenAiCompatProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Other {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_payload(
        &self,
        messages: &[Message],
        system: Option<&str>,
        tools: &[ToolDefinition],
        options: &LlmRequestOptions,
        stream: bool,
    ) -> Value {
        let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len() + 1);
        if let Some(system) = system {
            wire_messages.push(json!({"role": "system", "content": system}));
        }
        for msg in messages {
            wire_messages.push(message_to_wire(msg));
        }

        let mut payload = json!({
            "model": self.config.model,
            "messages": wire_messages,
            "stream": stream,
        });
        if stream {
            payload["stream_options"] = json!({"include_usage": true});
        }
        if let Some(temperature) = options.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if !tools.is_empty() {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            payload["tools"] = json!(wire_tools);
        }
        payload
    }

    async fn send_request(&self, payload: &Value) -> LlmResult<reqwest::Response> {
        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError {
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(parse_http_error(status.as_u16(), &body, "openai-compat"));
        }
        Ok(resp)
    }
}

fn message_to_wire(msg: &Message) -> Value {
    let role = match msg.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    };
    let mut wire = json!({"role": role, "content": msg.content});
    if let Some(tool_calls) = &msg.tool_calls {
        let calls: Vec<Value> = tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": {"name": c.name, "arguments": c.arguments},
                })
            })
            .collect();
        wire["tool_calls"] = json!(calls);
    }
    if let Some(id) = &msg.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

fn parse_usage(value: &Value) -> UsageStats {
    UsageStats {
        input_tokens: value["prompt_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: value["completion_tokens"].as_u64().unwrap_or(0) as u32,
    }
}

fn parse_tool_calls(value: &Value) -> Vec<ToolCall> {
    value
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|c| ToolCall {
                    id: c["id"].as_str().unwrap_or_default().to_string(),
                    name: c["function"]["name"].as_str().unwrap_or_default().to_string(),
                    arguments: c["function"]["arguments"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Accumulates streamed tool-call fragments keyed by index.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u64, ToolCall>,
}

impl ToolCallAccumulator {
    fn apply(&mut self, deltas: &Value) {
        let Some(deltas) = deltas.as_array() else {
            return;
        };
        for delta in deltas {
            let index = delta["index"].as_u64().unwrap_or(0);
            let entry = self.calls.entry(index).or_insert_with(|| ToolCall {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = delta["id"].as_str() {
                entry.id = id.to_string();
            }
            if let Some(name) = delta["function"]["name"].as_str() {
                entry.name.push_str(name);
            }
            if let Some(args) = delta["function"]["arguments"].as_str() {
                entry.arguments.push_str(args);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls.into_values().collect()
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai-compat"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn context_window(&self) -> u32 {
        self.config.context_window
    }

    async fn complete(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        tools: Vec<ToolDefinition>,
        options: LlmRequestOptions,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse> {
        let payload = self.build_payload(&messages, system.as_deref(), &tools, &options, false);

        let body: Value = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            resp = self.send_request(&payload) => {
                resp?.json().await.map_err(|e| LlmError::ParseError {
                    message: e.to_string(),
                })?
            }
        };

        let message = &body["choices"][0]["message"];
        Ok(LlmResponse {
            content: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls: parse_tool_calls(&message["tool_calls"]),
            usage: parse_usage(&body["usage"]),
            stop_reason: body["choices"][0]["finish_reason"]
                .as_str()
                .map(str::to_string),
        })
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        tools: Vec<ToolDefinition>,
        options: LlmRequestOptions,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse> {
        let payload = self.build_payload(&messages, system.as_deref(), &tools, &options, true);
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            resp = self.send_request(&payload) => resp?,
        };

        let mut byte_stream = resp.bytes_stream();
        let mut line_buffer = String::new();
        let mut content = String::new();
        let mut usage = UsageStats::default();
        let mut stop_reason = None;
        let mut tool_acc = ToolCallAccumulator::default();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(provider = self.name(), "stream cancelled");
                    return Err(LlmError::Cancelled);
                }
                next = byte_stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let bytes = chunk.map_err(|e| LlmError::NetworkError {
                message: e.to_string(),
            })?;
            line_buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = line_buffer.find('\n') {
                let line = line_buffer[..newline].trim().to_string();
                line_buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    continue;
                }
                let event: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "skipping malformed SSE line");
                        continue;
                    }
                };
                if event["usage"].is_object() {
                    usage = parse_usage(&event["usage"]);
                }
                let choice = &event["choices"][0];
                if let Some(reason) = choice["finish_reason"].as_str() {
                    stop_reason = Some(reason.to_string());
                }
                let delta = &choice["delta"];
                tool_acc.apply(&delta["tool_calls"]);
                if let Some(text) = delta["content"].as_str() {
                    if !text.is_empty() {
                        content.push_str(text);
                        // Receiver gone means the caller stopped consuming;
                        // finish accumulating so the final response is intact.
                        let _ = chunks.send(text.to_string()).await;
                    }
                }
            }
        }

        Ok(LlmResponse {
            content,
            tool_calls: tool_acc.finish(),
            usage,
            stop_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(ProviderConfig {
            base_url: "https://gateway.example.com/v1/".to_string(),
            api_key: "sk-test".to_string(),
            model: "gpt-test".to_string(),
            context_window: default_context_window(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn test_completions_url_trims_trailing_slash() {
        assert_eq!(
            provider().completions_url(),
            "https://gateway.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_payload_shape() {
        let p = provider();
        let payload = p.build_payload(
            &[Message::user("hello")],
            Some("be terse"),
            &[],
            &LlmRequestOptions {
                temperature: Some(0.2),
                max_tokens: Some(512),
            },
            false,
        );
        assert_eq!(payload["model"], "gpt-test");
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "hello");
        assert_eq!(payload["temperature"], 0.2);
        assert_eq!(payload["stream"], false);
        assert!(payload.get("tools").is_none());
    }

    #[test]
    fn test_tool_call_accumulation() {
        let mut acc = ToolCallAccumulator::default();
        acc.apply(&json!([
            {"index": 0, "id": "tc-1", "function": {"name": "read_", "arguments": "{\"pa"}}
        ]));
        acc.apply(&json!([
            {"index": 0, "function": {"name": "files", "arguments": "ths\":[]}"}}
        ]));
        let calls = acc.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tc-1");
        assert_eq!(calls[0].name, "read_files");
        assert_eq!(calls[0].arguments, "{\"paths\":[]}");
    }

    #[test]
    fn test_parse_usage() {
        let usage = parse_usage(&json!({"prompt_tokens": 12, "completion_tokens": 34}));
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 34);
    }

    #[test]
    fn test_message_to_wire_tool_result() {
        let wire = message_to_wire(&Message::tool_result("tc-9", "exec_commands", "ok"));
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "tc-9");
    }
}
