//! Conversation Model
//!
//! Messages are deduplicated by `conversationId` with last-writer-wins
//! semantics. Two tiers exist: the append-only full history (UI restoration)
//! and the compacted running history fed to the model each turn. Compacted
//! placeholders carry ids prefixed `archive-`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sentinel marking messages that are model context only; UI views filter
/// them out but they are retained for the model.
pub const INTERNAL_MEMO: &str = "<Internal Memo>";

/// Conversation-id prefix for compaction placeholders.
pub const ARCHIVE_PREFIX: &str = "archive-";

/// Message content: either plain text or structured parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    /// Flatten to display text. Parts contribute their `text` fields.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

/// A single conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    /// `user`, `assistant`, or `tool`.
    pub role: String,
    pub conversation_id: String,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ConversationMessage {
    pub fn user(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::plain("user", conversation_id, text)
    }

    pub fn assistant(conversation_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::plain("assistant", conversation_id, text)
    }

    fn plain(
        role: &str,
        conversation_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            role: role.to_string(),
            conversation_id: conversation_id.into(),
            content: MessageContent::Text(text.into()),
            tool_calls: None,
            name: None,
        }
    }

    /// Whether this message is hidden from UI views.
    pub fn is_internal_memo(&self) -> bool {
        self.content.as_text().contains(INTERNAL_MEMO)
    }

    /// Whether this message is a compaction placeholder.
    pub fn is_archive_placeholder(&self) -> bool {
        self.conversation_id.starts_with(ARCHIVE_PREFIX)
    }
}

/// Deduplicate by `conversationId`, keeping the later occurrence in place of
/// the earlier one (last-writer-wins; original ordering otherwise preserved).
pub fn dedup_messages(messages: &[ConversationMessage]) -> Vec<ConversationMessage> {
    let mut result: Vec<ConversationMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(existing) = result
            .iter_mut()
            .find(|m| m.conversation_id == msg.conversation_id)
        {
            *existing = msg.clone();
        } else {
            result.push(msg.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_untagged_round_trip() {
        let text: ConversationMessage = serde_json::from_value(json!({
            "role": "user",
            "conversationId": "c1",
            "content": "hello",
        }))
        .unwrap();
        assert_eq!(text.content.as_text(), "hello");

        let parts: ConversationMessage = serde_json::from_value(json!({
            "role": "assistant",
            "conversationId": "c2",
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
        }))
        .unwrap();
        assert_eq!(parts.content.as_text(), "a\nb");
    }

    #[test]
    fn test_internal_memo_detection() {
        let memo = ConversationMessage::assistant("c1", format!("{INTERNAL_MEMO} phase done"));
        assert!(memo.is_internal_memo());
        assert!(!ConversationMessage::user("c2", "hi").is_internal_memo());
    }

    #[test]
    fn test_dedup_last_writer_wins() {
        let messages = vec![
            ConversationMessage::user("c1", "first"),
            ConversationMessage::user("c2", "other"),
            ConversationMessage::user("c1", "second"),
        ];
        let deduped = dedup_messages(&messages);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].content.as_text(), "second");
        assert_eq!(deduped[1].conversation_id, "c2");
    }

    #[test]
    fn test_archive_placeholder() {
        let msg = ConversationMessage::assistant("archive-1", "previous history was compacted");
        assert!(msg.is_archive_placeholder());
    }
}
