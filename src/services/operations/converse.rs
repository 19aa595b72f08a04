//! User Conversation
//!
//! One conversational turn: the user message is combined with drained
//! runtime errors and accumulated project-update notes, the model may invoke
//! tools from the per-turn registry, and the streamed response plus the
//! updated running history come back to the caller.

use appforge_llm::{LlmRequestOptions, Message, MessageRole};
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::conversation::ConversationMessage;
use crate::services::operations::{stream_with_chunks, OperationContext, ToolRegistry};
use crate::services::sandbox::RuntimeError;
use crate::utils::error::AppResult;

/// Upper bound on tool-execution rounds within one turn.
const MAX_TOOL_ROUNDS: u32 = 5;

const SYSTEM_PROMPT: &str = "You are the assistant guiding an AI-generated application project. \
Answer the user, and use the available tools when the request calls for an action (queueing \
work, deploying, reading logs, debugging). Keep responses short and concrete.";

/// Inputs for one conversational turn.
#[derive(Debug, Clone)]
pub struct ConverseRequest {
    pub user_message: String,
    pub user_conversation_id: String,
    pub response_conversation_id: String,
    pub images: Vec<Value>,
    pub runtime_errors: Vec<RuntimeError>,
    pub project_updates: Vec<String>,
    pub running_history: Vec<ConversationMessage>,
}

/// Outcome of the turn.
#[derive(Debug, Clone)]
pub struct ConverseOutcome {
    pub user_response: String,
    pub new_running_history: Vec<ConversationMessage>,
}

/// Run one conversational turn. Response chunks stream through `on_chunk`
/// as they arrive.
pub async fn user_converse(
    ctx: &OperationContext,
    request: ConverseRequest,
    tools: &ToolRegistry,
    mut on_chunk: impl FnMut(String),
) -> AppResult<ConverseOutcome> {
    let mut messages = history_to_messages(&request.running_history);

    let mut user_text = request.user_message.clone();
    if !request.runtime_errors.is_empty() {
        let errors: Vec<String> = request
            .runtime_errors
            .iter()
            .map(|e| format!("- {}", e.message))
            .collect();
        user_text.push_str(&format!(
            "\n\nRuntime errors captured since the last turn:\n{}",
            errors.join("\n")
        ));
    }
    if !request.project_updates.is_empty() {
        user_text.push_str(&format!(
            "\n\nProject updates since the last turn:\n{}",
            request.project_updates.join("\n")
        ));
    }
    if !request.images.is_empty() {
        user_text.push_str(&format!("\n\n({} image(s) attached)", request.images.len()));
    }
    messages.push(Message::user(user_text));

    let definitions = tools.definitions();
    let mut final_response = String::new();

    for round in 0..=MAX_TOOL_ROUNDS {
        let response = stream_with_chunks(
            &ctx.provider,
            messages.clone(),
            Some(SYSTEM_PROMPT.to_string()),
            definitions.clone(),
            LlmRequestOptions {
                temperature: Some(0.7),
                max_tokens: None,
            },
            ctx.cancel.clone(),
            &mut on_chunk,
        )
        .await?;

        if response.tool_calls.is_empty() || round == MAX_TOOL_ROUNDS {
            if round == MAX_TOOL_ROUNDS && !response.tool_calls.is_empty() {
                warn!("tool round budget exhausted; returning last response");
            }
            final_response = response.content;
            break;
        }

        let mut assistant = Message::assistant(response.content.clone());
        assistant.tool_calls = Some(response.tool_calls.clone());
        messages.push(assistant);

        for call in &response.tool_calls {
            let args: Value =
                serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
            debug!(tool = %call.name, "conversation tool invoked");
            let result = tools.invoke(&call.name, args).await;
            messages.push(Message::tool_result(
                call.id.clone(),
                call.name.clone(),
                result.to_string(),
            ));
        }
    }

    let mut new_history = request.running_history.clone();
    new_history.push(ConversationMessage::user(
        request.user_conversation_id,
        request.user_message,
    ));
    new_history.push(ConversationMessage::assistant(
        request.response_conversation_id,
        final_response.clone(),
    ));

    Ok(ConverseOutcome {
        user_response: final_response,
        new_running_history: new_history,
    })
}

/// Map running-history entries to model messages. Tool-role bookkeeping
/// entries stay out of the model context.
fn history_to_messages(history: &[ConversationMessage]) -> Vec<Message> {
    history
        .iter()
        .filter_map(|msg| {
            let role = match msg.role.as_str() {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                _ => return None,
            };
            let text = msg.content.as_text();
            if text.is_empty() {
                return None;
            }
            Some(match role {
                MessageRole::User => Message::user(text),
                _ => Message::assistant(text),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_mapping_skips_tool_entries() {
        let history = vec![
            ConversationMessage::user("c1", "hello"),
            ConversationMessage::assistant("c2", "hi"),
            ConversationMessage {
                role: "tool".to_string(),
                conversation_id: "c3".to_string(),
                content: crate::models::conversation::MessageContent::Text("{}".to_string()),
                tool_calls: None,
                name: Some("deploy".to_string()),
            },
        ];
        let messages = history_to_messages(&history);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[test]
    fn test_history_mapping_skips_empty_text() {
        let history = vec![ConversationMessage::assistant("c1", "")];
        assert!(history_to_messages(&history).is_empty());
    }
}
