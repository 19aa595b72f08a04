//! Timeout Helper
//!
//! Every external call (sandbox, inference, registry, browser render) runs
//! under a deadline. Defaults: 30s for file reads and command batches.

use std::future::Future;
use std::time::Duration;

use crate::utils::error::{AppError, AppResult};

/// Default timeout for sandbox file reads.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 30_000;
/// Default timeout for a command batch.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Run `op` with a deadline of `ms` milliseconds; on expiry returns
/// `AppError::Timeout` carrying `message`.
pub async fn with_timeout<T>(
    op: impl Future<Output = AppResult<T>>,
    ms: u64,
    message: &str,
) -> AppResult<T> {
    match tokio::time::timeout(Duration::from_millis(ms), op).await {
        Ok(result) => result,
        Err(_) => Err(AppError::timeout(message)),
    }
}
