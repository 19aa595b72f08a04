//! Deep Debug
//!
//! Multi-turn debugging assistant with file-reading and shell-execution
//! tools, run in isolation from the main state machine. Produces a
//! transcript that is persisted and threaded into the next session as
//! context. A repetition guard detects tool-call loops and injects a
//! warning into the conversation instead of executing the repeated call.

use appforge_llm::{LlmRequestOptions, Message};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::services::operations::{stream_with_chunks, OperationContext, ToolRegistry};
use crate::services::sandbox::RuntimeError;
use crate::utils::error::AppResult;

/// Iteration budget for one debug session.
const MAX_ITERATIONS: u32 = 8;
/// A tool call repeated this many times in a row is a loop.
const LOOP_THRESHOLD: u32 = 2;

const SYSTEM_PROMPT: &str = "You are a debugging assistant for a generated web application. \
Investigate the reported issue with the available tools (read files, run commands, run static \
analysis), narrate what you find, and end with a concrete diagnosis and fix plan.";

/// Inputs for a debug session.
#[derive(Debug, Clone, Default)]
pub struct DeepDebugRequest {
    pub issue: String,
    pub previous_transcript: Option<String>,
    pub focus_paths: Vec<String>,
    pub runtime_errors: Vec<RuntimeError>,
}

/// Detects consecutive repetition of the same tool call.
struct LoopGuard {
    last_signature: Option<String>,
    repeats: u32,
}

impl LoopGuard {
    fn new() -> Self {
        Self {
            last_signature: None,
            repeats: 0,
        }
    }

    /// Record a call; returns true when this call crosses the loop
    /// threshold and must not execute.
    fn is_loop(&mut self, name: &str, args: &Value) -> bool {
        let signature = format!("{name}:{args}");
        if self.last_signature.as_deref() == Some(signature.as_str()) {
            self.repeats += 1;
        } else {
            self.last_signature = Some(signature);
            self.repeats = 0;
        }
        self.repeats >= LOOP_THRESHOLD
    }
}

/// Run a debug session. Assistant narration streams through `on_chunk`; the
/// returned string is the full transcript.
pub async fn deep_debug(
    ctx: &OperationContext,
    request: DeepDebugRequest,
    tools: &ToolRegistry,
    mut on_chunk: impl FnMut(String),
) -> AppResult<String> {
    let mut prompt = format!("Issue to debug: {}\n", request.issue);
    if !request.focus_paths.is_empty() {
        prompt.push_str(&format!("Focus on: {}\n", request.focus_paths.join(", ")));
    }
    if !request.runtime_errors.is_empty() {
        let errors: Vec<String> = request
            .runtime_errors
            .iter()
            .map(|e| format!("- {}", e.message))
            .collect();
        prompt.push_str(&format!("Captured runtime errors:\n{}\n", errors.join("\n")));
    }
    if let Some(previous) = &request.previous_transcript {
        prompt.push_str(&format!(
            "\nTranscript of the previous debug session:\n{previous}\n"
        ));
    }
    prompt.push_str(&format!("\nProject files:\n{}\n", ctx.file_inventory()));

    let mut messages = vec![Message::user(prompt)];
    let mut transcript = format!("# Deep debug: {}\n", request.issue);
    let mut guard = LoopGuard::new();
    let definitions = tools.definitions();

    for iteration in 0..MAX_ITERATIONS {
        let response = stream_with_chunks(
            &ctx.provider,
            messages.clone(),
            Some(SYSTEM_PROMPT.to_string()),
            definitions.clone(),
            LlmRequestOptions {
                temperature: Some(0.3),
                max_tokens: None,
            },
            ctx.cancel.clone(),
            &mut on_chunk,
        )
        .await?;

        if !response.content.is_empty() {
            transcript.push_str(&format!("\n{}\n", response.content));
        }
        if response.tool_calls.is_empty() {
            debug!(iteration, "debug session concluded");
            break;
        }

        let mut assistant = Message::assistant(response.content.clone());
        assistant.tool_calls = Some(response.tool_calls.clone());
        messages.push(assistant);

        for call in &response.tool_calls {
            let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
            let result = if guard.is_loop(&call.name, &args) {
                warn!(tool = %call.name, "tool-call loop detected");
                transcript.push_str(&format!(
                    "\n[loop detected on {name}; call suppressed]\n",
                    name = call.name
                ));
                json!({
                    "error": "LoopDetected",
                    "warning": format!(
                        "The call {name}({args}) was repeated {LOOP_THRESHOLD} times with \
                         identical arguments and was not executed. Change approach.",
                        name = call.name
                    ),
                })
            } else {
                transcript.push_str(&format!("\n[{name}({args})]\n", name = call.name));
                tools.invoke(&call.name, args.clone()).await
            };
            messages.push(Message::tool_result(
                call.id.clone(),
                call.name.clone(),
                result.to_string(),
            ));
        }
    }

    Ok(transcript)
}
