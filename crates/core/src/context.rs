//! Runtime Context
//!
//! The process-global services (environment bag, wall clock, id generation)
//! modeled as an explicit context passed into every operation instead of
//! being reached through statics. This keeps operations deterministic under
//! test: a scripted clock and id source reproduce exact persisted documents
//! and commit timestamps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock abstraction. Production uses [`SystemClock`]; tests may pin
/// time to make commit timestamps and TTL caches deterministic.
pub trait Clock: Send + Sync {
    /// Milliseconds since the unix epoch.
    fn now_millis(&self) -> i64;
}

/// System wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Id generation abstraction (conversation ids, project-name suffixes).
pub trait IdGen: Send + Sync {
    /// A fresh short identifier, URL-safe, 6-12 characters.
    fn short_id(&self) -> String;
}

/// Explicit runtime context shared by every operation.
///
/// Cloning is cheap; the inner services are reference-counted.
#[derive(Clone)]
pub struct RuntimeContext {
    env: Arc<HashMap<String, String>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGen>,
}

impl RuntimeContext {
    pub fn new(
        env: HashMap<String, String>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGen>,
    ) -> Self {
        Self {
            env: Arc::new(env),
            clock,
            ids,
        }
    }

    /// Look up an environment value.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|s| s.as_str())
    }

    /// Environment value with a fallback default.
    pub fn env_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.env(key).unwrap_or(default)
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn short_id(&self) -> String {
        self.ids.short_id()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("env_keys", &self.env.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(i64);
    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0
        }
    }

    struct CountingIds(std::sync::atomic::AtomicU64);
    impl IdGen for CountingIds {
        fn short_id(&self) -> String {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("id{n}")
        }
    }

    fn test_context() -> RuntimeContext {
        let mut env = HashMap::new();
        env.insert("SANDBOX_URL".to_string(), "http://localhost:3000".to_string());
        RuntimeContext::new(
            env,
            Arc::new(FixedClock(1_700_000_000_000)),
            Arc::new(CountingIds(std::sync::atomic::AtomicU64::new(0))),
        )
    }

    #[test]
    fn test_env_lookup() {
        let ctx = test_context();
        assert_eq!(ctx.env("SANDBOX_URL"), Some("http://localhost:3000"));
        assert_eq!(ctx.env("MISSING"), None);
        assert_eq!(ctx.env_or("MISSING", "fallback"), "fallback");
    }

    #[test]
    fn test_pinned_clock() {
        let ctx = test_context();
        assert_eq!(ctx.now_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_id_sequence() {
        let ctx = test_context();
        assert_eq!(ctx.short_id(), "id0");
        assert_eq!(ctx.short_id(), "id1");
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        assert!(clock.now_millis() > 1_600_000_000_000);
    }
}
