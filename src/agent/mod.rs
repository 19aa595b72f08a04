//! Agent Layer
//!
//! The composition root (`Orchestrator`), the phase state machine, the
//! per-client broadcaster, the client message router, and the deterministic
//! command pipeline.

pub mod broadcaster;
pub mod commands;
pub mod orchestrator;
pub mod router;
pub mod state_machine;

use std::sync::{Arc, RwLock};

use appforge_core::context::RuntimeContext;
use appforge_llm::InferenceProvider;

use crate::models::state::TemplateDetails;
use crate::services::conversation::ConversationLog;
use crate::services::deployment::DeploymentManager;
use crate::services::file_manager::FileManager;
use crate::services::git_store::GitStore;
use crate::services::registry::AppRegistry;
use crate::services::sandbox::SandboxApi;
use crate::storage::store::Store;
use broadcaster::Broadcaster;

/// Shared collaborators, owned by the orchestrator and borrowed by the
/// state machine and conversation tools.
pub struct AgentDeps {
    pub store: Arc<Store>,
    pub git: Arc<GitStore>,
    pub files: Arc<FileManager>,
    pub conversation: Arc<ConversationLog>,
    pub sandbox: Arc<dyn SandboxApi>,
    pub registry: Arc<dyn AppRegistry>,
    pub deployment: Arc<DeploymentManager>,
    pub provider: Arc<dyn InferenceProvider>,
    pub broadcaster: Arc<Broadcaster>,
    pub template: Arc<RwLock<TemplateDetails>>,
    pub runtime: RuntimeContext,
}

impl AgentDeps {
    /// Snapshot of the template details cache.
    pub fn template_snapshot(&self) -> TemplateDetails {
        self.template.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
