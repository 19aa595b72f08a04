//! Conversation Log
//!
//! Two-tier chat history persisted as serialized arrays: the append-only
//! full history (UI restoration) and the compacted running history fed to
//! the model each turn. Both tiers are keyed by session id and deduplicated
//! by `conversationId` with last-writer-wins semantics.

use std::sync::Arc;

use tracing::debug;

use crate::models::conversation::{dedup_messages, ConversationMessage, ARCHIVE_PREFIX};
use crate::storage::database::{ConversationTier, Database};
use crate::utils::error::AppResult;

/// Default session key when none is supplied.
pub const DEFAULT_SESSION: &str = "default";

/// Placeholder text inserted where history was compacted away.
pub const COMPACTION_PLACEHOLDER: &str = "previous history was compacted";

/// Running-history length that triggers compaction.
const COMPACTION_THRESHOLD: usize = 50;
/// Recent messages preserved verbatim through compaction.
const COMPACTION_PRESERVE_TAIL: usize = 10;

/// Two-tier persistent conversation store.
pub struct ConversationLog {
    db: Arc<Database>,
    session_id: String,
}

impl ConversationLog {
    pub fn new(db: Arc<Database>, session_id: Option<String>) -> Self {
        Self {
            db,
            session_id: session_id.unwrap_or_else(|| DEFAULT_SESSION.to_string()),
        }
    }

    /// Upsert a message into both tiers and write back the serialized
    /// arrays.
    pub fn append(&self, msg: &ConversationMessage) -> AppResult<()> {
        for tier in [ConversationTier::Full, ConversationTier::Compact] {
            let mut messages = self.load_tier(tier)?;
            if let Some(existing) = messages
                .iter_mut()
                .find(|m| m.conversation_id == msg.conversation_id)
            {
                *existing = msg.clone();
            } else {
                messages.push(msg.clone());
            }
            self.save_tier(tier, &messages)?;
        }
        Ok(())
    }

    /// The deduplicated `(full, running)` pair. When the compact tier is
    /// empty (documents written before the two-tier split), the full history
    /// stands in for it.
    pub fn get(&self) -> AppResult<(Vec<ConversationMessage>, Vec<ConversationMessage>)> {
        let full = dedup_messages(&self.load_tier(ConversationTier::Full)?);
        let compact = dedup_messages(&self.load_tier(ConversationTier::Compact)?);
        let running = if compact.is_empty() {
            full.clone()
        } else {
            compact
        };
        Ok((full, running))
    }

    /// Messages for UI views: the full history minus internal memos.
    pub fn ui_messages(&self) -> AppResult<Vec<ConversationMessage>> {
        let (full, _) = self.get()?;
        Ok(full.into_iter().filter(|m| !m.is_internal_memo()).collect())
    }

    /// Replace the running history outright (after a conversational turn
    /// returns its updated state).
    pub fn replace_running(&self, messages: &[ConversationMessage]) -> AppResult<()> {
        self.save_tier(ConversationTier::Compact, messages)
    }

    /// Compact the running history in place when it has outgrown the
    /// threshold: everything but the tail collapses into one archive
    /// placeholder. Returns the number of messages removed.
    pub fn compact_running(&self, now_millis: i64) -> AppResult<usize> {
        let (_, running) = self.get()?;
        if running.len() <= COMPACTION_THRESHOLD {
            return Ok(0);
        }

        let preserved_from = running.len() - COMPACTION_PRESERVE_TAIL;
        let removed = preserved_from;
        let mut compacted = Vec::with_capacity(COMPACTION_PRESERVE_TAIL + 1);
        compacted.push(ConversationMessage::assistant(
            format!("{ARCHIVE_PREFIX}{now_millis}"),
            COMPACTION_PLACEHOLDER,
        ));
        compacted.extend_from_slice(&running[preserved_from..]);
        self.save_tier(ConversationTier::Compact, &compacted)?;

        debug!(
            session_id = %self.session_id,
            removed,
            preserved = COMPACTION_PRESERVE_TAIL,
            "compacted running history"
        );
        Ok(removed)
    }

    fn load_tier(&self, tier: ConversationTier) -> AppResult<Vec<ConversationMessage>> {
        match self.db.load_conversation(tier, &self.session_id)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_tier(&self, tier: ConversationTier, messages: &[ConversationMessage]) -> AppResult<()> {
        self.db
            .save_conversation(tier, &self.session_id, &serde_json::to_string(messages)?)
    }
}
