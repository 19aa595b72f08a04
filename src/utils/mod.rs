//! Shared utilities: application error type, timeout helper, id generation.

pub mod error;
pub mod ids;
pub mod timeout;

pub use error::{AppError, AppResult};
pub use ids::UuidIdGen;
pub use timeout::with_timeout;
