//! Persistence layer: embedded SQLite database and the write-through
//! project-state store.

pub mod database;
pub mod store;

pub use database::{ConversationTier, Database, StoredCommit};
pub use store::{StateChangedCallback, Store};
