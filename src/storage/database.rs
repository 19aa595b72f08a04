//! SQLite Database
//!
//! Embedded database for persistent storage using rusqlite with r2d2
//! connection pooling. Holds the per-project state document, the two
//! conversation tiers, and the content-addressed version-store tables.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::utils::error::{AppError, AppResult};

/// Type alias for the connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Which conversation tier a read/write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationTier {
    /// Append-only record used for UI restoration.
    Full,
    /// Compacted working set fed to the model.
    Compact,
}

impl ConversationTier {
    fn table(self) -> &'static str {
        match self {
            ConversationTier::Full => "full_conversations",
            ConversationTier::Compact => "compact_conversations",
        }
    }
}

/// A commit row of the version store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommit {
    pub oid: String,
    pub parent: Option<String>,
    pub message: String,
    pub author: String,
    /// Unix millis.
    pub timestamp: i64,
    /// JSON object mapping path → blob oid.
    pub tree_json: String,
}

/// Database service for managing SQLite operations
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| AppError::database(format!("Failed to create connection pool: {e}")))?;

        let db = Self { pool };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> AppResult<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS project_state (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS full_conversations (
                id TEXT PRIMARY KEY,
                messages TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS compact_conversations (
                id TEXT PRIMARY KEY,
                messages TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS git_blobs (
                oid TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS git_commits (
                oid TEXT PRIMARY KEY,
                parent TEXT,
                message TEXT NOT NULL,
                author TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                tree TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS git_refs (
                name TEXT PRIMARY KEY,
                oid TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> AppResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::database(format!("Failed to get connection: {e}")))
    }

    /// Check if the database is healthy
    pub fn is_healthy(&self) -> bool {
        if let Ok(conn) = self.pool.get() {
            conn.query_row("SELECT 1", [], |_| Ok(())).is_ok()
        } else {
            false
        }
    }

    // ========================================================================
    // Project state document
    // ========================================================================

    /// Load the serialized state document for a project.
    pub fn load_project_state(&self, id: &str) -> AppResult<Option<String>> {
        let conn = self.get_connection()?;
        let result = conn
            .query_row(
                "SELECT state FROM project_state WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Persist the serialized state document for a project.
    pub fn save_project_state(&self, id: &str, state: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO project_state (id, state, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(id) DO UPDATE SET state = ?2, updated_at = CURRENT_TIMESTAMP",
            params![id, state],
        )?;
        Ok(())
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Read the serialized message array of a conversation tier.
    pub fn load_conversation(
        &self,
        tier: ConversationTier,
        id: &str,
    ) -> AppResult<Option<String>> {
        let conn = self.get_connection()?;
        let sql = format!("SELECT messages FROM {} WHERE id = ?1", tier.table());
        let result = conn
            .query_row(&sql, params![id], |row| row.get(0))
            .optional()?;
        Ok(result)
    }

    /// Write back the serialized message array of a conversation tier.
    pub fn save_conversation(
        &self,
        tier: ConversationTier,
        id: &str,
        messages: &str,
    ) -> AppResult<()> {
        let conn = self.get_connection()?;
        let sql = format!(
            "INSERT INTO {table} (id, messages) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET messages = ?2",
            table = tier.table()
        );
        conn.execute(&sql, params![id, messages])?;
        Ok(())
    }

    // ========================================================================
    // Version store objects
    // ========================================================================

    /// Store a content-addressed blob (no-op when the oid already exists).
    pub fn put_blob(&self, oid: &str, data: &[u8]) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO git_blobs (oid, data) VALUES (?1, ?2)",
            params![oid, data],
        )?;
        Ok(())
    }

    /// Fetch a blob by oid.
    pub fn get_blob(&self, oid: &str) -> AppResult<Option<Vec<u8>>> {
        let conn = self.get_connection()?;
        let result = conn
            .query_row(
                "SELECT data FROM git_blobs WHERE oid = ?1",
                params![oid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Store a commit record.
    pub fn put_commit(&self, commit: &StoredCommit) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO git_commits (oid, parent, message, author, timestamp, tree)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                commit.oid,
                commit.parent,
                commit.message,
                commit.author,
                commit.timestamp,
                commit.tree_json
            ],
        )?;
        Ok(())
    }

    /// Fetch a commit record by oid.
    pub fn get_commit(&self, oid: &str) -> AppResult<Option<StoredCommit>> {
        let conn = self.get_connection()?;
        let result = conn
            .query_row(
                "SELECT oid, parent, message, author, timestamp, tree
                 FROM git_commits WHERE oid = ?1",
                params![oid],
                |row| {
                    Ok(StoredCommit {
                        oid: row.get(0)?,
                        parent: row.get(1)?,
                        message: row.get(2)?,
                        author: row.get(3)?,
                        timestamp: row.get(4)?,
                        tree_json: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Read a ref (e.g. `HEAD`).
    pub fn get_ref(&self, name: &str) -> AppResult<Option<String>> {
        let conn = self.get_connection()?;
        let result = conn
            .query_row(
                "SELECT oid FROM git_refs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    /// Point a ref at a commit.
    pub fn set_ref(&self, name: &str, oid: &str) -> AppResult<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "INSERT INTO git_refs (name, oid) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET oid = ?2",
            params![name, oid],
        )?;
        Ok(())
    }
}
