//! Agent Streaming Protocol
//!
//! The typed, tagged-union message stream exchanged between the orchestrator
//! and its connected clients. Both directions are newline-delimited JSON
//! objects discriminated by a string `type` field.
//!
//! `AgentEvent` is the one-way agent → client stream; `ClientRequest` is the
//! client → agent direction. Unknown tags are rejected at the message router
//! and surfaced back as an `error` event rather than being silently dropped.
//!
//! Loosely-structured payloads (full state snapshots, phase concepts) travel
//! as `serde_json::Value` so this crate stays independent of the application
//! data model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One-way event stream from the orchestrator to a connected client.
///
/// Events broadcast to a single client are delivered in the order they were
/// produced. Chunk events (`file_chunk_generated`) are best-effort: a slow
/// client may miss chunks but always receives the terminating
/// `file_generated` for the same path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message after a client connects: full state + template details.
    AgentConnected {
        state: Value,
        template_details: Value,
    },

    /// Full state snapshot, sent after every state mutation so clients can
    /// reconcile.
    CfAgentState { state: Value },

    // ========================================================================
    // Conversation
    // ========================================================================
    /// Current conversational history (UI view, internal memos filtered out).
    ConversationState { messages: Vec<Value> },

    /// Streamed chunk of an assistant conversational response.
    ConversationResponse {
        conversation_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool: Option<Value>,
    },

    /// The conversation working set was emptied.
    ConversationCleared,

    // ========================================================================
    // File generation
    // ========================================================================
    /// Generation of a file has started.
    FileGenerating { path: String, purpose: String },

    /// Incremental contents for a file currently being generated.
    FileChunkGenerated { path: String, chunk: String },

    /// A file finished generating.
    FileGenerated { path: String, purpose: String },

    /// A single file is being regenerated to address issues.
    FileRegenerating { path: String },

    /// File regeneration finished.
    FileRegenerated { path: String },

    // ========================================================================
    // Generation lifecycle
    // ========================================================================
    GenerationStarted,
    GenerationComplete,
    GenerationStopped { message: String },
    GenerationResumed,

    // ========================================================================
    // Phase lifecycle
    // ========================================================================
    PhaseGenerating { message: String },
    PhaseGenerated { phase: Value },
    PhaseImplementing { phase: Value },
    PhaseValidating { name: String },
    PhaseValidated {
        name: String,
        issue_count: usize,
    },
    PhaseImplemented { phase: Value },

    // ========================================================================
    // Deployment
    // ========================================================================
    DeploymentStarted { message: String },
    DeploymentCompleted {
        preview_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tunnel_url: Option<String>,
    },
    DeploymentFailed { message: String },

    CloudflareDeploymentStarted { message: String },
    CloudflareDeploymentCompleted {
        deployment_id: String,
        deployment_url: String,
    },
    CloudflareDeploymentError { message: String },

    // ========================================================================
    // GitHub export
    // ========================================================================
    GithubExportStarted,
    GithubExportProgress { step: String, progress: u8 },
    GithubExportCompleted {
        repository_url: String,
        commit_sha: String,
    },
    GithubExportError { message: String },

    // ========================================================================
    // Validation & fixing
    // ========================================================================
    /// Runtime errors drained from the sandbox.
    RuntimeErrorFound { errors: Vec<Value> },

    CodeReviewing { message: String },
    CodeReviewed { review: Value },

    StaticAnalysisResults { lint: Value, typecheck: Value },

    DeterministicCodeFixStarted,
    DeterministicCodeFixCompleted {
        fixed_count: usize,
        unfixable_count: usize,
    },

    /// Instruct clients to reload the preview iframe.
    PreviewForceRefresh,

    // ========================================================================
    // Errors
    // ========================================================================
    RateLimitError { details: String },
    Error { message: String },

    // ========================================================================
    // Auxiliary
    // ========================================================================
    ModelConfigsInfo { configs: Value },
    TerminalOutput { output: String },
    ServerLog { stdout: String, stderr: String },

    ScreenshotCaptureStarted,
    ScreenshotCaptureSuccess { url: String },
    ScreenshotCaptureError { message: String },

    ProjectNameUpdated { project_name: String },
    BlueprintUpdated { blueprint: Value },
}

impl AgentEvent {
    /// Whether this event is a best-effort streaming chunk that may be
    /// dropped for a slow client without breaking the protocol.
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            AgentEvent::FileChunkGenerated { .. } | AgentEvent::ConversationResponse { .. }
        )
    }

    /// The wire tag of this event (the serde `type` discriminator).
    pub fn tag(&self) -> &'static str {
        match self {
            AgentEvent::AgentConnected { .. } => "agent_connected",
            AgentEvent::CfAgentState { .. } => "cf_agent_state",
            AgentEvent::ConversationState { .. } => "conversation_state",
            AgentEvent::ConversationResponse { .. } => "conversation_response",
            AgentEvent::ConversationCleared => "conversation_cleared",
            AgentEvent::FileGenerating { .. } => "file_generating",
            AgentEvent::FileChunkGenerated { .. } => "file_chunk_generated",
            AgentEvent::FileGenerated { .. } => "file_generated",
            AgentEvent::FileRegenerating { .. } => "file_regenerating",
            AgentEvent::FileRegenerated { .. } => "file_regenerated",
            AgentEvent::GenerationStarted => "generation_started",
            AgentEvent::GenerationComplete => "generation_complete",
            AgentEvent::GenerationStopped { .. } => "generation_stopped",
            AgentEvent::GenerationResumed => "generation_resumed",
            AgentEvent::PhaseGenerating { .. } => "phase_generating",
            AgentEvent::PhaseGenerated { .. } => "phase_generated",
            AgentEvent::PhaseImplementing { .. } => "phase_implementing",
            AgentEvent::PhaseValidating { .. } => "phase_validating",
            AgentEvent::PhaseValidated { .. } => "phase_validated",
            AgentEvent::PhaseImplemented { .. } => "phase_implemented",
            AgentEvent::DeploymentStarted { .. } => "deployment_started",
            AgentEvent::DeploymentCompleted { .. } => "deployment_completed",
            AgentEvent::DeploymentFailed { .. } => "deployment_failed",
            AgentEvent::CloudflareDeploymentStarted { .. } => "cloudflare_deployment_started",
            AgentEvent::CloudflareDeploymentCompleted { .. } => "cloudflare_deployment_completed",
            AgentEvent::CloudflareDeploymentError { .. } => "cloudflare_deployment_error",
            AgentEvent::GithubExportStarted => "github_export_started",
            AgentEvent::GithubExportProgress { .. } => "github_export_progress",
            AgentEvent::GithubExportCompleted { .. } => "github_export_completed",
            AgentEvent::GithubExportError { .. } => "github_export_error",
            AgentEvent::RuntimeErrorFound { .. } => "runtime_error_found",
            AgentEvent::CodeReviewing { .. } => "code_reviewing",
            AgentEvent::CodeReviewed { .. } => "code_reviewed",
            AgentEvent::StaticAnalysisResults { .. } => "static_analysis_results",
            AgentEvent::DeterministicCodeFixStarted => "deterministic_code_fix_started",
            AgentEvent::DeterministicCodeFixCompleted { .. } => "deterministic_code_fix_completed",
            AgentEvent::PreviewForceRefresh => "preview_force_refresh",
            AgentEvent::RateLimitError { .. } => "rate_limit_error",
            AgentEvent::Error { .. } => "error",
            AgentEvent::ModelConfigsInfo { .. } => "model_configs_info",
            AgentEvent::TerminalOutput { .. } => "terminal_output",
            AgentEvent::ServerLog { .. } => "server_log",
            AgentEvent::ScreenshotCaptureStarted => "screenshot_capture_started",
            AgentEvent::ScreenshotCaptureSuccess { .. } => "screenshot_capture_success",
            AgentEvent::ScreenshotCaptureError { .. } => "screenshot_capture_error",
            AgentEvent::ProjectNameUpdated { .. } => "project_name_updated",
            AgentEvent::BlueprintUpdated { .. } => "blueprint_updated",
        }
    }
}

/// Client → agent requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Request the current preview URL (deploying if necessary).
    Preview,
    /// Enter the generation state machine.
    GenerateAll,
    /// Cancel the current inference and return the state machine to idle.
    StopGeneration,
    /// Mark the project as wanting generation and re-enter if idle.
    ResumeGeneration,
    /// Empty the conversation working set.
    ClearConversation,
    /// A user message / suggestion, optionally with attached images.
    UserSuggestion {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<Value>>,
    },
    /// Ask for the per-operation model configuration table.
    GetModelConfigs,
    /// Run a one-off shell command against the sandbox.
    TerminalCommand { command: String },
}
