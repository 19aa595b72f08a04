//! AppForge Core
//!
//! Foundational error types, the typed client streaming protocol, and the
//! explicit runtime context for the AppForge workspace. This crate has zero
//! dependencies on application-level code (database, HTTP clients, LLM
//! providers, etc.).
//!
//! ## Module Organization
//!
//! - `error` - Core error types (`CoreError`, `CoreResult`)
//! - `events` - Agent/client streaming protocol (`AgentEvent`, `ClientRequest`)
//! - `context` - Explicit runtime context (`RuntimeContext`, `Clock`, `IdGen`)
//!
//! ## Design Principles
//!
//! 1. **Zero external dependencies beyond serde/thiserror** - keeps build times minimal
//! 2. **Tagged unions over inheritance** - every protocol message is a serde
//!    discriminated union matched exhaustively at the boundaries
//! 3. **Unidirectional dependency** - this crate depends on nothing else in the workspace

pub mod context;
pub mod error;
pub mod events;

// ── Error Types ────────────────────────────────────────────────────────
pub use error::{CoreError, CoreResult};

// ── Streaming Protocol ─────────────────────────────────────────────────
pub use events::{AgentEvent, ClientRequest};

// ── Runtime Context ────────────────────────────────────────────────────
pub use context::{Clock, IdGen, RuntimeContext, SystemClock};
