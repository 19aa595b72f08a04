//! Error Handling
//!
//! Unified error type for the orchestrator. Uses thiserror for ergonomic
//! error definitions and extends the core error set with variants that
//! require heavier dependencies (database, sandbox, inference).

use appforge_llm::LlmError;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Sandbox service errors
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Model inference errors; `LlmError::RateLimited` is handled specially
    /// at the state-machine run boundary.
    #[error("Inference error: {0}")]
    Inference(#[from] LlmError),

    /// Version-store errors
    #[error("Git error: {0}")]
    Git(String),

    /// Command execution errors
    #[error("Command error: {0}")]
    Command(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A state-machine run is active; deep debug must wait.
    #[error("GENERATION_IN_PROGRESS")]
    GenerationInProgress,

    /// A deep-debug session is active; generation must wait.
    #[error("DEBUG_IN_PROGRESS")]
    DebugInProgress,

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a sandbox error
    pub fn sandbox(msg: impl Into<String>) -> Self {
        Self::Sandbox(msg.into())
    }

    /// Create a git error
    pub fn git(msg: impl Into<String>) -> Self {
        Self::Git(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the underlying cause is a model rate limit.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, AppError::Inference(e) if e.is_rate_limit())
    }
}

impl From<appforge_core::CoreError> for AppError {
    fn from(err: appforge_core::CoreError) -> Self {
        use appforge_core::CoreError;
        match err {
            CoreError::Config(m) => AppError::Config(m),
            CoreError::Io(e) => AppError::Io(e),
            CoreError::Serialization(e) => AppError::Serialization(e),
            CoreError::Validation(m) => AppError::Validation(m),
            CoreError::NotFound(m) => AppError::NotFound(m),
            CoreError::Timeout(m) => AppError::Timeout(m),
            CoreError::Internal(m) => AppError::Internal(m),
        }
    }
}

/// Convert AppError to a string suitable for protocol error events
impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::sandbox("instance unreachable");
        assert_eq!(err.to_string(), "Sandbox error: instance unreachable");
    }

    #[test]
    fn test_conflict_tags_are_stable() {
        assert_eq!(
            AppError::GenerationInProgress.to_string(),
            "GENERATION_IN_PROGRESS"
        );
        assert_eq!(AppError::DebugInProgress.to_string(), "DEBUG_IN_PROGRESS");
    }

    #[test]
    fn test_rate_limit_detection() {
        let err: AppError = LlmError::RateLimited {
            message: "slow down".to_string(),
            retry_after: None,
        }
        .into();
        assert!(err.is_rate_limit());
        assert!(!AppError::validation("nope").is_rate_limit());
    }

    #[test]
    fn test_core_error_conversion() {
        let err: AppError = appforge_core::CoreError::not_found("missing").into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
