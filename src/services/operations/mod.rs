//! Model-Backed Operations
//!
//! Pure operations invoked by the state machine and the conversation layer.
//! Each takes an `OperationContext` (state snapshot, template details,
//! provider handle, cancellation token, runtime context) and a typed
//! request, and returns typed data parsed out of model output.
//!
//! Nested operations reuse the parent's cancellation token, so a single
//! stop request cancels an entire run.

pub mod blueprint;
pub mod converse;
pub mod deep_debug;
pub mod deterministic_fixer;
pub mod fast_fixer;
pub mod phase_implementation;
pub mod phase_planning;
pub mod regenerate;
pub mod setup;

use std::sync::Arc;

use appforge_core::context::RuntimeContext;
use appforge_llm::{
    InferenceProvider, LlmRequestOptions, LlmResponse, Message, ToolDefinition,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::state::{ProjectState, TemplateDetails};
use crate::utils::error::{AppError, AppResult};

/// Shared context handed to every model-backed operation.
#[derive(Clone)]
pub struct OperationContext {
    /// Immutable state snapshot taken at operation start.
    pub state: ProjectState,
    pub template: TemplateDetails,
    pub provider: Arc<dyn InferenceProvider>,
    pub cancel: CancellationToken,
    pub runtime: RuntimeContext,
}

impl OperationContext {
    /// One line per known file for prompt context: `path - purpose`.
    pub fn file_inventory(&self) -> String {
        let mut lines: Vec<String> = self
            .template
            .important_files
            .iter()
            .map(|p| format!("{p} - template"))
            .collect();
        for (path, file) in &self.state.generated_files_map {
            lines.push(format!("{path} - {}", file.purpose));
        }
        lines.join("\n")
    }
}

/// A tool exposed to the model during a conversation or debug turn.
///
/// Each tool is a name + schema + implementation; the registry is rebuilt
/// per turn so per-turn counters (like the deep-debug once-per-turn guard)
/// reset at construction.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;

    /// Execute with raw JSON args. Errors are returned as structured values
    /// (`{"error": ...}`) so the model can react to them.
    async fn invoke(&self, args: Value) -> Value;
}

/// Per-turn tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.push(tool);
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.schema(),
            })
            .collect()
    }

    /// Invoke a tool by name; unknown names produce a structured error the
    /// model can read.
    pub async fn invoke(&self, name: &str, args: Value) -> Value {
        match self.tools.iter().find(|t| t.name() == name) {
            Some(tool) => tool.invoke(args).await,
            None => json!({"error": format!("unknown tool: {name}")}),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Stream a model response, forwarding raw text deltas to `on_chunk` while
/// the request runs. Returns the accumulated final response.
pub async fn stream_with_chunks(
    provider: &Arc<dyn InferenceProvider>,
    messages: Vec<Message>,
    system: Option<String>,
    tools: Vec<ToolDefinition>,
    options: LlmRequestOptions,
    cancel: CancellationToken,
    mut on_chunk: impl FnMut(String),
) -> AppResult<LlmResponse> {
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let stream = provider.stream(messages, system, tools, options, tx, cancel);
    tokio::pin!(stream);

    let response = loop {
        tokio::select! {
            chunk = rx.recv() => {
                if let Some(chunk) = chunk {
                    on_chunk(chunk);
                }
            }
            result = &mut stream => break result?,
        }
    };
    while let Ok(chunk) = rx.try_recv() {
        on_chunk(chunk);
    }
    Ok(response)
}

/// Extract and parse the first JSON value from model output. Handles fenced
/// ```json blocks and prose-wrapped objects/arrays.
pub fn extract_json<T: DeserializeOwned>(raw: &str) -> AppResult<T> {
    let candidate = json_candidate(raw)
        .ok_or_else(|| AppError::validation("model output contains no JSON value"))?;
    serde_json::from_str(candidate)
        .map_err(|e| AppError::validation(format!("model output is not valid JSON: {e}")))
}

fn json_candidate(raw: &str) -> Option<&str> {
    // Fenced block first.
    if let Some(start) = raw.find("```json") {
        let body = &raw[start + 7..];
        if let Some(end) = body.find("```") {
            return Some(body[..end].trim());
        }
    }
    // First balanced object or array otherwise.
    let open = raw.find(['{', '['])?;
    let bytes = raw.as_bytes();
    let (open_ch, close_ch) = if bytes[open] == b'{' {
        (b'{', b'}')
    } else {
        (b'[', b']')
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[open..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b if b == open_ch => depth += 1,
            b if b == close_ch => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[open..=open + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Extract the first fenced code block's body (any language tag).
pub fn extract_code_block(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].to_string())
}

/// Static per-operation model configuration table served to clients on
/// `get_model_configs`.
pub fn model_configs(provider: &Arc<dyn InferenceProvider>) -> Value {
    let model = provider.model();
    json!({
        "planBlueprint": {"model": model, "temperature": 0.7},
        "planNextPhase": {"model": model, "temperature": 0.4},
        "implementPhase": {"model": model, "temperature": 0.2},
        "regenerateFile": {"model": model, "temperature": 0.0},
        "fastCodeFixer": {"model": model, "temperature": 0.0},
        "userConverse": {"model": model, "temperature": 0.7},
        "deepDebug": {"model": model, "temperature": 0.3},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fenced_block() {
        let raw = "Here is the plan:\n```json\n{\"name\": \"API\"}\n```\nDone.";
        let value: Value = extract_json(raw).unwrap();
        assert_eq!(value["name"], "API");
    }

    #[test]
    fn test_extract_json_from_prose() {
        let raw = "The phase is {\"name\": \"API\", \"nested\": {\"a\": 1}} as requested.";
        let value: Value = extract_json(raw).unwrap();
        assert_eq!(value["nested"]["a"], 1);
    }

    #[test]
    fn test_extract_json_handles_braces_in_strings() {
        let raw = r#"{"code": "if (x) { return \"}\"; }"}"#;
        let value: Value = extract_json(raw).unwrap();
        assert!(value["code"].as_str().unwrap().contains("return"));
    }

    #[test]
    fn test_extract_json_array() {
        let raw = "commands: [\"bun install\", \"bun run build\"]";
        let value: Vec<String> = extract_json(raw).unwrap();
        assert_eq!(value.len(), 2);
    }

    #[test]
    fn test_extract_json_rejects_plain_text() {
        let result: AppResult<Value> = extract_json("no structured data here");
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_code_block() {
        let raw = "Fixed file:\n```tsx\nexport default 1;\n```";
        assert_eq!(extract_code_block(raw).unwrap(), "export default 1;\n");
        assert!(extract_code_block("no fences").is_none());
    }

    #[tokio::test]
    async fn test_registry_unknown_tool_is_structured_error() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("missing", json!({})).await;
        assert!(result["error"].as_str().unwrap().contains("missing"));
    }
}
