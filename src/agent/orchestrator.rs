//! Orchestrator
//!
//! Composition root and external API: one instance per project, owning the
//! store, version store, file manager, conversation log, deployment
//! manager, and broadcaster. Write-side operations behave as a
//! single-threaded actor; reads are concurrent snapshots.
//!
//! Generation is single-flight: concurrent `generate_all_files` callers
//! share one underlying run. Deep debug is likewise single-flight and never
//! overlaps a generation run; either direction gets a typed conflict error.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use appforge_core::context::RuntimeContext;
use appforge_core::events::AgentEvent;
use appforge_llm::InferenceProvider;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::broadcaster::{Broadcaster, ClientReceiver};
use crate::agent::commands;
use crate::agent::state_machine::{StateMachine, DEFAULT_REVIEW_CYCLES};
use crate::agent::AgentDeps;
use crate::models::phase::{FileConcept, GeneratedFile, PhaseConcept};
use crate::models::state::{ProjectState, TemplateDetails};
use crate::models::{apply_blueprint_patch, blueprint::Blueprint};
use crate::services::conversation::ConversationLog;
use crate::services::deployment::{CloudDeploy, DeploymentManager};
use crate::services::file_manager::FileManager;
use crate::services::git_store::GitStore;
use crate::services::github::{GithubExporter, PushOptions, PushResult};
use crate::services::operations::phase_implementation::{self, ImplementPhaseRequest};
use crate::services::operations::phase_planning::UserContext;
use crate::services::operations::{
    self, converse, deep_debug, regenerate, setup, AgentTool, OperationContext, ToolRegistry,
};
use crate::services::registry::{AppRecord, AppRegistry, AppUpdate};
use crate::services::sandbox::{
    DeployOptions, DeployResult, FileReadResult, LogsResult, RuntimeError, SandboxApi,
    StaticAnalysis,
};
use crate::services::screenshot::{ScreenshotService, Viewport};
use crate::storage::database::Database;
use crate::storage::store::Store;
use crate::utils::error::{AppError, AppResult};
use crate::utils::timeout::{with_timeout, DEFAULT_READ_TIMEOUT_MS};

/// Construction inputs: the external collaborators behind trait seams.
pub struct OrchestratorDeps {
    pub db: Arc<Database>,
    pub project_id: String,
    pub sandbox: Arc<dyn SandboxApi>,
    pub registry: Arc<dyn AppRegistry>,
    pub cloud: Arc<dyn CloudDeploy>,
    pub provider: Arc<dyn InferenceProvider>,
    pub runtime: RuntimeContext,
    pub screenshots: Option<Arc<ScreenshotService>>,
}

/// Inputs for `initialize`.
pub struct InitializeArgs {
    pub query: String,
    pub language: String,
    pub frameworks: Vec<String>,
    pub hostname: String,
    pub user_id: String,
    pub inference_context: Value,
    pub template: TemplateDetails,
    pub images: Vec<Value>,
}

struct GenerationSlot {
    cancel: Option<CancellationToken>,
    done_rx: Option<watch::Receiver<bool>>,
}

/// The per-project orchestrator.
pub struct Orchestrator {
    deps: Arc<AgentDeps>,
    github: GithubExporter,
    screenshots: Option<Arc<ScreenshotService>>,
    generation: Mutex<GenerationSlot>,
    debug_active: AtomicBool,
    /// In-memory user images; deliberately not persisted.
    images: Mutex<Vec<Value>>,
    name_pattern: Regex,
}

impl Orchestrator {
    /// Wire up all components for one project. The version-store → file
    /// manager cycle is broken here with the one-way on-change callback.
    pub fn new(inputs: OrchestratorDeps) -> AppResult<Arc<Self>> {
        let store = Arc::new(Store::load_or_init(
            Arc::clone(&inputs.db),
            inputs.project_id.clone(),
            ProjectState::default(),
        )?);
        let git = Arc::new(GitStore::new(
            Arc::clone(&inputs.db),
            inputs.runtime.clock(),
            "appforge",
        ));
        git.init()?;
        let template = Arc::new(RwLock::new(TemplateDetails::default()));
        let files = Arc::new(FileManager::new(
            Arc::clone(&store),
            Arc::clone(&git),
            Arc::clone(&template),
            inputs.runtime.clock(),
        ));
        {
            // Weak reference: the store holds no strong handle back into the
            // file manager, keeping the callback one-way.
            let files = Arc::downgrade(&files);
            git.set_on_files_changed(Arc::new(move || {
                if let Some(files) = files.upgrade() {
                    if let Err(e) = files.sync_from_head() {
                        warn!(error = %e, "sync from HEAD failed");
                    }
                }
            }));
        }
        let conversation = Arc::new(ConversationLog::new(Arc::clone(&inputs.db), None));
        let deployment = Arc::new(DeploymentManager::new(
            Arc::clone(&inputs.sandbox),
            Arc::clone(&inputs.cloud),
        ));

        let broadcaster = Arc::new(Broadcaster::new());
        {
            // Every persisted mutation reaches clients as a full-state
            // reconciliation event, regardless of which call site wrote.
            let broadcaster = Arc::clone(&broadcaster);
            store.set_on_change(Arc::new(move |state| {
                match serde_json::to_value(state) {
                    Ok(state) => {
                        broadcaster.broadcast(&AgentEvent::CfAgentState { state });
                    }
                    Err(e) => warn!(error = %e, "state snapshot serialization failed"),
                }
            }));
        }

        let deps = Arc::new(AgentDeps {
            store,
            git,
            files,
            conversation,
            sandbox: inputs.sandbox,
            registry: inputs.registry,
            deployment,
            provider: inputs.provider,
            broadcaster,
            template,
            runtime: inputs.runtime.clone(),
        });

        Ok(Arc::new(Self {
            deps,
            github: GithubExporter::new(inputs.runtime.clock()),
            screenshots: inputs.screenshots,
            generation: Mutex::new(GenerationSlot {
                cancel: None,
                done_rx: None,
            }),
            debug_active: AtomicBool::new(false),
            images: Mutex::new(Vec::new()),
            name_pattern: Regex::new("^[a-z0-9_-]{3,50}$").expect("static name pattern"),
        }))
    }

    pub fn deps(&self) -> &Arc<AgentDeps> {
        &self.deps
    }

    pub fn state(&self) -> ProjectState {
        self.deps.store.snapshot()
    }

    fn broadcast(&self, event: AgentEvent) {
        self.deps.broadcaster.broadcast(&event);
    }

    fn op_context(&self, cancel: CancellationToken) -> OperationContext {
        OperationContext {
            state: self.deps.store.snapshot(),
            template: self.deps.template_snapshot(),
            provider: Arc::clone(&self.deps.provider),
            cancel,
            runtime: self.deps.runtime.clone(),
        }
    }

    // ========================================================================
    // Client lifecycle
    // ========================================================================

    /// Register a client; it immediately receives `agent_connected` with the
    /// full state and template details.
    pub fn connect_client(&self, client_id: &str) -> AppResult<ClientReceiver> {
        let receiver = self.deps.broadcaster.connect(client_id);
        let state = serde_json::to_value(self.deps.store.snapshot())?;
        let template_details = serde_json::to_value(self.deps.template_snapshot())?;
        self.deps.broadcaster.send_to(
            client_id,
            &AgentEvent::AgentConnected {
                state,
                template_details,
            },
        );
        Ok(receiver)
    }

    pub fn disconnect_client(&self, client_id: &str) {
        self.deps.broadcaster.disconnect(client_id);
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Plan the blueprint, write the customized project configuration
    /// files, and kick off the background bring-up tasks (sandbox deploy,
    /// setup commands, README).
    pub async fn initialize(
        self: &Arc<Self>,
        args: InitializeArgs,
        mut on_blueprint_chunk: impl FnMut(String),
    ) -> AppResult<ProjectState> {
        *self
            .deps
            .template
            .write()
            .unwrap_or_else(|e| e.into_inner()) = args.template.clone();
        *self.images.lock().unwrap_or_else(|e| e.into_inner()) = args.images;

        let project_name = self.project_name_from_query(&args.query);
        let now = self.deps.runtime.now_millis();
        self.deps.store.mutate(|s| {
            s.query = args.query.clone();
            s.hostname = args.hostname.clone();
            s.user_id = args.user_id.clone();
            s.inference_context = args.inference_context.clone();
            s.template_name = args.template.name.clone();
            s.project_name = project_name.clone();
            s.created_at = now;
            s.phases_counter = 3;
            s.should_be_generating = true;
        })?;

        if let Err(e) = self
            .deps
            .registry
            .create_app(AppRecord {
                id: self.deps.store.project_id().to_string(),
                title: project_name.clone(),
                status: "generating".to_string(),
                visibility: "private".to_string(),
                ..Default::default()
            })
            .await
        {
            warn!(error = %e, "registry createApp failed");
        }

        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let blueprint = operations::blueprint::plan_blueprint(
            &ctx,
            operations::blueprint::BlueprintRequest {
                query: args.query,
                language: args.language,
                frameworks: args.frameworks,
                project_name: project_name.clone(),
            },
            &mut on_blueprint_chunk,
        )
        .await?;
        self.deps
            .store
            .mutate(|s| s.blueprint = Some(blueprint.clone()))?;
        self.broadcast(AgentEvent::BlueprintUpdated {
            blueprint: serde_json::to_value(&blueprint)?,
        });

        let config_files = customize_template_files(&args.template, &project_name);
        self.deps
            .files
            .save_generated_files(config_files, Some("Initialize project configuration files"))?;

        // Background bring-up; none of these block initialization.
        let agent = Arc::clone(self);
        tokio::spawn(async move { agent.background_bringup().await });

        Ok(self.deps.store.snapshot())
    }

    async fn background_bringup(self: Arc<Self>) {
        if let Err(e) = self.deploy_to_sandbox(None, false, None, true).await {
            warn!(error = %e, "initial sandbox deploy failed");
        }
        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel.clone());
        match setup::generate_setup_commands(&ctx).await {
            Ok(cmds) if !cmds.is_empty() => {
                if let Err(e) = self.exec_commands(&cmds, true, None).await {
                    warn!(error = %e, "setup commands failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "setup command generation failed"),
        }
        match setup::generate_readme(&ctx).await {
            Ok(readme) => {
                let file = GeneratedFile::new("README.md", readme)
                    .with_purpose("project overview and run instructions");
                if let Err(e) = self
                    .deps
                    .files
                    .save_generated_files(vec![file], Some("Add README"))
                {
                    warn!(error = %e, "README save failed");
                }
            }
            Err(e) => warn!(error = %e, "README generation failed"),
        }
    }

    fn project_name_from_query(&self, query: &str) -> String {
        let base: String = query
            .to_lowercase()
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join("-")
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let suffix = self.deps.runtime.short_id();
        let suffix = &suffix[..suffix.len().min(6)];
        let budget = 20usize.saturating_sub(suffix.len() + 1);
        let mut slug: String = base.chars().take(budget).collect();
        slug = slug.trim_matches('-').to_string();
        if slug.len() < 3 {
            slug = format!("app-{slug}");
        }
        format!("{slug}-{suffix}")
    }

    // ========================================================================
    // Generation lifecycle
    // ========================================================================

    /// Whether a state-machine run is in flight.
    pub fn is_code_generating(&self) -> bool {
        self.generation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .done_rx
            .as_ref()
            .map(|rx| !*rx.borrow())
            .unwrap_or(false)
    }

    /// Enter the state machine. Single-flight: a second caller awaits the
    /// same run. No-op when the MVP is generated and nothing is queued.
    pub async fn generate_all_files(self: &Arc<Self>, review_cycles: u32) -> AppResult<()> {
        let state = self.deps.store.snapshot();
        if state.mvp_generated && state.pending_user_inputs.is_empty() {
            return Ok(());
        }
        if self.debug_active.load(Ordering::SeqCst) {
            return Err(AppError::DebugInProgress);
        }

        let rx = {
            let mut slot = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            match slot.done_rx.as_ref().filter(|rx| !*rx.borrow()) {
                Some(rx) => rx.clone(),
                None => {
                    let cancel = CancellationToken::new();
                    let (done_tx, done_rx) = watch::channel(false);
                    slot.cancel = Some(cancel.clone());
                    slot.done_rx = Some(done_rx.clone());

                    let deps = Arc::clone(&self.deps);
                    let agent = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = StateMachine::run(&deps, cancel, review_cycles).await {
                            warn!(error = %e, "state machine run failed");
                        }
                        agent.clear_generation_slot();
                        let _ = done_tx.send(true);
                    });
                    done_rx
                }
            }
        };

        let mut rx = rx;
        let _ = rx.wait_for(|done| *done).await;
        Ok(())
    }

    fn clear_generation_slot(&self) {
        let mut slot = self.generation.lock().unwrap_or_else(|e| e.into_inner());
        slot.cancel = None;
    }

    /// Cancel the current inference, return the machine to idle, and
    /// broadcast `generation_stopped`. Already-persisted state is kept.
    pub fn stop_generation(&self) -> AppResult<()> {
        let cancel = {
            let mut slot = self.generation.lock().unwrap_or_else(|e| e.into_inner());
            let cancel = slot.cancel.take();
            slot.done_rx = None;
            cancel
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.deps.store.mutate(|s| {
            s.should_be_generating = false;
            s.current_dev_state = crate::models::state::DevState::Idle;
        })?;
        self.broadcast(AgentEvent::GenerationStopped {
            message: "Generation stopped by user".to_string(),
        });
        Ok(())
    }

    /// Mark the project as wanting generation and re-enter when idle.
    pub fn resume_generation(self: &Arc<Self>) -> AppResult<()> {
        self.deps
            .store
            .mutate(|s| s.should_be_generating = true)?;
        self.broadcast(AgentEvent::GenerationResumed);
        if !self.is_code_generating() {
            let agent = Arc::clone(self);
            tokio::spawn(async move {
                let _ = agent.generate_all_files(DEFAULT_REVIEW_CYCLES).await;
            });
        }
        Ok(())
    }

    // ========================================================================
    // Conversation
    // ========================================================================

    /// Process a user message: pull runtime errors and accumulated project
    /// updates, run the conversational turn with its per-turn tool registry,
    /// persist both history tiers, and start the state machine if idle.
    pub async fn handle_user_input(
        self: &Arc<Self>,
        text: &str,
        images: Option<Vec<Value>>,
    ) -> AppResult<String> {
        if let Some(images) = images {
            self.images
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(images);
        }

        let runtime_errors = self.fetch_runtime_errors(true).await.unwrap_or_default();
        let project_updates = self
            .deps
            .store
            .mutate(|s| std::mem::take(&mut s.project_updates_accumulator))?;
        let (_, running_history) = self.deps.conversation.get()?;

        let response_id = format!("conv-{}", self.deps.runtime.short_id());
        let request = converse::ConverseRequest {
            user_message: text.to_string(),
            user_conversation_id: format!("user-{}", self.deps.runtime.short_id()),
            response_conversation_id: response_id.clone(),
            images: self
                .images
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            runtime_errors,
            project_updates,
            running_history,
        };

        let registry = self.conversation_tools();
        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let broadcaster = Arc::clone(&self.deps.broadcaster);
        let outcome = converse::user_converse(&ctx, request, &registry, |chunk| {
            broadcaster.broadcast(&AgentEvent::ConversationResponse {
                conversation_id: response_id.clone(),
                content: chunk,
                tool: None,
            });
        })
        .await?;

        for message in outcome
            .new_running_history
            .iter()
            .rev()
            .take(2)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
        {
            self.deps.conversation.append(message)?;
        }
        self.deps
            .conversation
            .replace_running(&outcome.new_running_history)?;
        self.deps
            .conversation
            .compact_running(self.deps.runtime.now_millis())?;
        self.deps.store.mutate(|s| {
            s.conversation_messages = outcome.new_running_history.clone();
        })?;
        self.broadcast_conversation_state()?;

        if !self.is_code_generating() && !self.deps.store.snapshot().pending_user_inputs.is_empty()
        {
            let agent = Arc::clone(self);
            tokio::spawn(async move {
                let _ = agent.generate_all_files(DEFAULT_REVIEW_CYCLES).await;
            });
        }

        Ok(outcome.user_response)
    }

    fn broadcast_conversation_state(&self) -> AppResult<()> {
        let messages: Vec<Value> = self
            .deps
            .conversation
            .ui_messages()?
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;
        self.broadcast(AgentEvent::ConversationState { messages });
        Ok(())
    }

    /// Queue a user request for the next planning pass and recharge the
    /// phase budget. Images stay in memory only.
    pub fn queue_user_request(&self, text: &str, images: Option<Vec<Value>>) -> AppResult<()> {
        if let Some(images) = images {
            self.images
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(images);
        }
        self.deps.store.mutate(|s| {
            s.pending_user_inputs.push(text.to_string());
            s.phases_counter = s.phases_counter.max(3);
        })?;
        Ok(())
    }

    /// Empty the conversation working set (the persisted full history is
    /// untouched).
    pub fn clear_conversation(&self) -> AppResult<()> {
        self.deps.store.mutate(|s| s.conversation_messages.clear())?;
        self.deps.conversation.replace_running(&[])?;
        self.broadcast(AgentEvent::ConversationCleared);
        Ok(())
    }

    // ========================================================================
    // Project metadata
    // ========================================================================

    /// Rename the project. Returns `Ok(false)` (no state change) when the
    /// name fails the slug pattern.
    pub async fn update_project_name(&self, name: &str) -> AppResult<bool> {
        if !self.name_pattern.is_match(name) {
            return Ok(false);
        }
        self.deps.store.mutate(|s| {
            s.project_name = name.to_string();
            if let Some(blueprint) = &mut s.blueprint {
                blueprint.project_name = name.to_string();
            }
        })?;

        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        if let Err(e) = self
            .deps
            .sandbox
            .update_project_name(&session_id, name)
            .await
        {
            warn!(error = %e, "sandbox rename failed");
        }
        if let Err(e) = self
            .deps
            .registry
            .update_app(self.deps.store.project_id(), AppUpdate::title(name))
            .await
        {
            warn!(error = %e, "registry rename failed");
        }
        self.broadcast(AgentEvent::ProjectNameUpdated {
            project_name: name.to_string(),
        });
        Ok(true)
    }

    /// Whitelisted deep merge into the blueprint. A `projectName` key
    /// delegates to the rename path.
    pub async fn update_blueprint(&self, patch: Value) -> AppResult<()> {
        if let Some(name) = patch.get("projectName").and_then(Value::as_str) {
            let name = name.to_string();
            if !self.update_project_name(&name).await? {
                return Err(AppError::validation(format!("invalid project name: {name}")));
            }
        }
        let updated = self.deps.store.mutate(|s| -> AppResult<Option<Blueprint>> {
            let Some(blueprint) = &s.blueprint else {
                return Ok(None);
            };
            let mut value = serde_json::to_value(blueprint)?;
            apply_blueprint_patch(&mut value, &patch);
            let merged: Blueprint = serde_json::from_value(value)?;
            s.blueprint = Some(merged.clone());
            Ok(Some(merged))
        })??;
        if let Some(blueprint) = updated {
            self.broadcast(AgentEvent::BlueprintUpdated {
                blueprint: serde_json::to_value(&blueprint)?,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Deploys
    // ========================================================================

    /// Deploy to the sandbox with start/complete/error events.
    pub async fn deploy_to_sandbox(
        &self,
        files: Option<Vec<GeneratedFile>>,
        redeploy: bool,
        commit_message: Option<String>,
        clear_logs: bool,
    ) -> AppResult<DeployResult> {
        self.broadcast(AgentEvent::DeploymentStarted {
            message: "Deploying to sandbox".to_string(),
        });
        let payload: Vec<crate::services::sandbox::SandboxFile> = match files {
            Some(files) => files
                .into_iter()
                .map(|f| crate::services::sandbox::SandboxFile {
                    path: f.path,
                    contents: f.contents,
                })
                .collect(),
            None => self
                .deps
                .files
                .get_all_files()
                .into_iter()
                .map(|(path, contents)| crate::services::sandbox::SandboxFile { path, contents })
                .collect(),
        };
        let result = self
            .deps
            .deployment
            .deploy(
                &self.deps.store,
                payload,
                DeployOptions {
                    redeploy,
                    clear_logs,
                    commit_message,
                },
            )
            .await;
        match result {
            Ok(result) => {
                self.broadcast(AgentEvent::DeploymentCompleted {
                    preview_url: result.preview_url.clone(),
                    tunnel_url: result.tunnel_url.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                self.broadcast(AgentEvent::DeploymentFailed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Current preview, deploying first when no valid cache exists. An
    /// expired preview (unhealthy instance) gets exactly one redeploy
    /// attempt.
    pub async fn preview(&self) -> AppResult<DeployResult> {
        if let Some(cached) = self.deps.deployment.cached_preview() {
            if self.deps.deployment.is_healthy(&self.deps.store).await {
                self.broadcast(AgentEvent::DeploymentCompleted {
                    preview_url: cached.preview_url.clone(),
                    tunnel_url: cached.tunnel_url.clone(),
                });
                return Ok(cached);
            }
            return self.deploy_to_sandbox(None, true, None, false).await;
        }
        self.deploy_to_sandbox(None, false, None, false).await
    }

    /// Deploy to the cloud with start/complete/error events; the deployment
    /// id lands on the registry row.
    pub async fn deploy_to_cloudflare(&self) -> AppResult<()> {
        self.broadcast(AgentEvent::CloudflareDeploymentStarted {
            message: "Deploying to Cloudflare".to_string(),
        });
        if self.deps.deployment.cached_preview().is_none() {
            // Make sure a sandbox build exists before shipping it.
            if let Err(e) = self.deploy_to_sandbox(None, false, None, false).await {
                self.broadcast(AgentEvent::CloudflareDeploymentError {
                    message: e.to_string(),
                });
                return Err(e);
            }
        }
        match self.deps.deployment.deploy_to_cloud(&self.deps.store).await {
            Ok(deployment) => {
                if let Err(e) = self
                    .deps
                    .registry
                    .update_app(
                        self.deps.store.project_id(),
                        AppUpdate {
                            deployment_id: Some(deployment.deployment_id.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(error = %e, "registry deployment update failed");
                }
                self.broadcast(AgentEvent::CloudflareDeploymentCompleted {
                    deployment_id: deployment.deployment_id,
                    deployment_url: deployment.deployment_url,
                });
                Ok(())
            }
            Err(e) => {
                self.broadcast(AgentEvent::CloudflareDeploymentError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ========================================================================
    // GitHub / screenshots
    // ========================================================================

    /// Export the project history to GitHub with progress events.
    pub async fn push_to_github(&self, options: PushOptions) -> AppResult<PushResult> {
        self.broadcast(AgentEvent::GithubExportStarted);
        let state = self.deps.store.snapshot();
        let template_files = self.deps.template_snapshot().all_files;
        let broadcaster = Arc::clone(&self.deps.broadcaster);
        let repository_url = options.repository_html_url.clone();

        let result = self
            .github
            .push(
                &self.deps.git,
                &template_files,
                state.created_at,
                &state.query,
                options,
                |step, progress| {
                    broadcaster.broadcast(&AgentEvent::GithubExportProgress {
                        step: step.to_string(),
                        progress,
                    });
                },
            )
            .await;

        match result {
            Ok(result) => {
                if let Err(e) = self
                    .deps
                    .registry
                    .update_app(
                        self.deps.store.project_id(),
                        AppUpdate {
                            github_repository_url: Some(repository_url),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(error = %e, "registry github-url update failed");
                }
                self.broadcast(AgentEvent::GithubExportCompleted {
                    repository_url: result.repository_url.clone(),
                    commit_sha: result.commit_sha.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                self.broadcast(AgentEvent::GithubExportError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Capture a screenshot of `url` and persist its URL on the registry
    /// row.
    pub async fn capture_screenshot(&self, url: &str, viewport: Viewport) -> AppResult<String> {
        let Some(screenshots) = &self.screenshots else {
            return Err(AppError::config("screenshot service not configured"));
        };
        self.broadcast(AgentEvent::ScreenshotCaptureStarted);
        match screenshots.capture(url, viewport).await {
            Ok(screenshot_url) => {
                if let Err(e) = self
                    .deps
                    .registry
                    .update_app(
                        self.deps.store.project_id(),
                        AppUpdate {
                            screenshot_url: Some(screenshot_url.clone()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    warn!(error = %e, "registry screenshot update failed");
                }
                self.broadcast(AgentEvent::ScreenshotCaptureSuccess {
                    url: screenshot_url.clone(),
                });
                Ok(screenshot_url)
            }
            Err(e) => {
                self.broadcast(AgentEvent::ScreenshotCaptureError {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    // ========================================================================
    // Sandbox passthroughs
    // ========================================================================

    pub async fn read_files(&self, paths: &[String]) -> AppResult<FileReadResult> {
        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        with_timeout(
            self.deps.sandbox.get_files(&session_id, paths),
            DEFAULT_READ_TIMEOUT_MS,
            "sandbox file read timed out",
        )
        .await
    }

    /// Execute one-off commands; with `should_save` the successes are
    /// recorded into the command history and the bootstrap script.
    pub async fn exec_commands(
        self: &Arc<Self>,
        cmds: &[String],
        should_save: bool,
        timeout_ms: Option<u64>,
    ) -> AppResult<Vec<String>> {
        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let broadcaster = Arc::clone(&self.deps.broadcaster);
        let on_output = move |output: String| {
            broadcaster.broadcast(&AgentEvent::TerminalOutput { output });
        };
        let outcome = commands::run_command_pipeline(
            &self.deps.sandbox,
            &session_id,
            &ctx,
            cmds,
            timeout_ms.or(Some(crate::utils::timeout::DEFAULT_COMMAND_TIMEOUT_MS)),
            &on_output,
        )
        .await?;

        if should_save && !outcome.successful.is_empty() {
            let history = self.deps.store.mutate(|s| {
                s.commands_history.extend(outcome.successful.clone());
                s.commands_history = commands::validate_and_clean(&s.commands_history);
                s.commands_history.clone()
            })?;
            self.deps.files.save_generated_files(
                vec![GeneratedFile::new(
                    commands::BOOTSTRAP_PATH,
                    commands::render_bootstrap_script(&history),
                )
                .with_purpose("replays setup commands on cold-start clones")],
                None,
            )?;
        }
        Ok(outcome.successful)
    }

    pub async fn run_static_analysis_code(
        &self,
        files: Option<Vec<String>>,
    ) -> AppResult<StaticAnalysis> {
        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        let analysis = self
            .deps
            .sandbox
            .run_static_analysis(&session_id, files)
            .await?;
        self.broadcast(AgentEvent::StaticAnalysisResults {
            lint: serde_json::to_value(&analysis.lint)?,
            typecheck: serde_json::to_value(&analysis.typecheck)?,
        });
        Ok(analysis)
    }

    pub async fn fetch_runtime_errors(&self, clear: bool) -> AppResult<Vec<RuntimeError>> {
        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        let errors = self
            .deps
            .sandbox
            .fetch_runtime_errors(&session_id, clear)
            .await?;
        if !errors.is_empty() {
            let payload: Vec<Value> = errors
                .iter()
                .map(serde_json::to_value)
                .collect::<Result<_, _>>()?;
            self.broadcast(AgentEvent::RuntimeErrorFound { errors: payload });
        }
        Ok(errors)
    }

    pub async fn get_logs(
        &self,
        reset: bool,
        duration_seconds: Option<u32>,
    ) -> AppResult<LogsResult> {
        let session_id = self.deps.deployment.ensure_session(&self.deps.store)?;
        let logs = self
            .deps
            .sandbox
            .get_logs(&session_id, reset, duration_seconds)
            .await?;
        self.broadcast(AgentEvent::ServerLog {
            stdout: logs.stdout.clone(),
            stderr: logs.stderr.clone(),
        });
        Ok(logs)
    }

    // ========================================================================
    // File operations
    // ========================================================================

    /// Regenerate one file against the given issues and commit the result.
    pub async fn regenerate_file_by_path(
        &self,
        path: &str,
        issues: &[crate::services::sandbox::AnalysisIssue],
    ) -> AppResult<GeneratedFile> {
        let state = self.deps.store.snapshot();
        let file = state
            .generated_files_map
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("generated file {path}")))?;

        self.broadcast(AgentEvent::FileRegenerating {
            path: path.to_string(),
        });
        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let regenerated = regenerate::regenerate_file(&ctx, &file, issues, 0).await?;
        let saved = self
            .deps
            .files
            .save_generated_files(vec![regenerated], Some(&format!("Regenerate {path}")))?;
        self.broadcast(AgentEvent::FileRegenerated {
            path: path.to_string(),
        });
        saved
            .into_iter()
            .next()
            .ok_or_else(|| AppError::internal("save returned no file"))
    }

    /// Generate an ad-hoc set of files outside the phase lifecycle.
    pub async fn generate_files(
        &self,
        phase_name: &str,
        description: &str,
        requirements: &[String],
        files: &[(String, String)],
    ) -> AppResult<Vec<GeneratedFile>> {
        let concepts: Vec<FileConcept> = files
            .iter()
            .map(|(path, purpose)| FileConcept::new(path.clone(), purpose.clone()))
            .collect();
        let phase = PhaseConcept::new(
            format!("adhoc-{}", self.deps.runtime.short_id()),
            phase_name,
            format!("{description}\n{}", requirements.join("\n")),
        )
        .with_files(concepts);

        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let broadcaster = Arc::clone(&self.deps.broadcaster);
        let on_event = move |event: AgentEvent| broadcaster.broadcast(&event);
        let implemented = phase_implementation::implement_phase(
            &ctx,
            ImplementPhaseRequest {
                phase,
                issues: Vec::new(),
                is_first_phase: false,
                user_context: UserContext::default(),
            },
            false,
            &on_event,
        )
        .await?;
        self.deps
            .files
            .save_generated_files(implemented.files.clone(), Some(phase_name))?;
        Ok(implemented.files)
    }

    // ========================================================================
    // Deep debug
    // ========================================================================

    /// Run a deep-debug session. Refuses while generation is active
    /// (`GENERATION_IN_PROGRESS`) and while another session runs
    /// (`DEBUG_IN_PROGRESS`). The transcript persists and threads into the
    /// next session.
    pub async fn deep_debug(
        self: &Arc<Self>,
        issue: &str,
        focus_paths: Vec<String>,
    ) -> AppResult<String> {
        if self.is_code_generating() {
            return Err(AppError::GenerationInProgress);
        }
        if self.debug_active.swap(true, Ordering::SeqCst) {
            return Err(AppError::DebugInProgress);
        }

        let result = self.deep_debug_inner(issue, focus_paths).await;
        self.debug_active.store(false, Ordering::SeqCst);
        result
    }

    async fn deep_debug_inner(
        self: &Arc<Self>,
        issue: &str,
        focus_paths: Vec<String>,
    ) -> AppResult<String> {
        let runtime_errors = self.fetch_runtime_errors(true).await.unwrap_or_default();
        let previous_transcript = self.deps.store.snapshot().last_deep_debug_transcript;

        let registry = self.debug_tools();
        let cancel = CancellationToken::new();
        let ctx = self.op_context(cancel);
        let conversation_id = format!("debug-{}", self.deps.runtime.short_id());
        let broadcaster = Arc::clone(&self.deps.broadcaster);

        let transcript = deep_debug::deep_debug(
            &ctx,
            deep_debug::DeepDebugRequest {
                issue: issue.to_string(),
                previous_transcript,
                focus_paths,
                runtime_errors,
            },
            &registry,
            |chunk| {
                broadcaster.broadcast(&AgentEvent::ConversationResponse {
                    conversation_id: conversation_id.clone(),
                    content: chunk,
                    tool: None,
                });
            },
        )
        .await?;

        self.deps
            .store
            .mutate(|s| s.last_deep_debug_transcript = Some(transcript.clone()))?;
        Ok(transcript)
    }

    /// Await completion of any in-flight generation run.
    pub async fn wait_for_generation(&self) {
        let rx = self
            .generation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .done_rx
            .clone();
        if let Some(mut rx) = rx {
            let _ = rx.wait_for(|done| *done).await;
        }
    }

    // ========================================================================
    // Tool registries (rebuilt per turn)
    // ========================================================================

    fn conversation_tools(self: &Arc<Self>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(QueueRequestTool {
            agent: Arc::clone(self),
        }));
        registry.register(Arc::new(GetLogsTool {
            agent: Arc::clone(self),
        }));
        registry.register(Arc::new(DeployTool {
            agent: Arc::clone(self),
        }));
        registry.register(Arc::new(DeepDebugTool {
            agent: Arc::clone(self),
            calls_this_turn: AtomicU32::new(0),
        }));
        registry.register(Arc::new(WaitForGenerationTool {
            agent: Arc::clone(self),
        }));
        registry
    }

    fn debug_tools(self: &Arc<Self>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(ReadFilesTool {
            agent: Arc::clone(self),
        }));
        registry.register(Arc::new(ExecCommandsTool {
            agent: Arc::clone(self),
        }));
        registry.register(Arc::new(StaticAnalysisTool {
            agent: Arc::clone(self),
        }));
        registry
    }

    pub fn model_configs(&self) -> Value {
        operations::model_configs(&self.deps.provider)
    }
}

/// Customize template configuration files for a new project: the package
/// manifest and deploy config carry the project name, the bootstrap script
/// starts empty, and the ignore file is passed through.
pub fn customize_template_files(
    template: &TemplateDetails,
    project_name: &str,
) -> Vec<GeneratedFile> {
    let mut files = Vec::new();

    if let Some(package_json) = template.all_files.get("package.json") {
        let customized = match serde_json::from_str::<Value>(package_json) {
            Ok(mut value) => {
                value["name"] = json!(project_name);
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| package_json.clone())
            }
            Err(_) => package_json.clone(),
        };
        files.push(
            GeneratedFile::new("package.json", customized).with_purpose("project manifest"),
        );
    }

    if let Some(wrangler) = template.all_files.get("wrangler.jsonc") {
        let name_re = Regex::new(r#""name"\s*:\s*"[^"]*""#).expect("static wrangler name regex");
        let customized = name_re
            .replace(wrangler, format!(r#""name": "{project_name}""#).as_str())
            .into_owned();
        files.push(
            GeneratedFile::new("wrangler.jsonc", customized).with_purpose("deploy configuration"),
        );
    }

    files.push(
        GeneratedFile::new(
            commands::BOOTSTRAP_PATH,
            commands::render_bootstrap_script(&[]),
        )
        .with_purpose("replays setup commands on cold-start clones"),
    );

    if let Some(gitignore) = template.all_files.get(".gitignore") {
        files.push(GeneratedFile::new(".gitignore", gitignore.clone()).with_purpose("vcs ignore"));
    }

    files
}

// ============================================================================
// Conversation & debug tools
// ============================================================================

struct QueueRequestTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for QueueRequestTool {
    fn name(&self) -> &str {
        "queue_request"
    }

    fn description(&self) -> &str {
        "Queue an implementation request for the next phase of generation"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"request": {"type": "string"}},
            "required": ["request"],
        })
    }

    async fn invoke(&self, args: Value) -> Value {
        let Some(request) = args.get("request").and_then(Value::as_str) else {
            return json!({"error": "missing request"});
        };
        match self.agent.queue_user_request(request, None) {
            Ok(()) => json!({"queued": true}),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct GetLogsTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for GetLogsTool {
    fn name(&self) -> &str {
        "get_logs"
    }

    fn description(&self) -> &str {
        "Read the application's server logs from the sandbox"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"reset": {"type": "boolean"}},
        })
    }

    async fn invoke(&self, args: Value) -> Value {
        let reset = args.get("reset").and_then(Value::as_bool).unwrap_or(false);
        match self.agent.get_logs(reset, None).await {
            Ok(logs) => json!({"stdout": logs.stdout, "stderr": logs.stderr}),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct DeployTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for DeployTool {
    fn name(&self) -> &str {
        "deploy_preview"
    }

    fn description(&self) -> &str {
        "Deploy the current files to the sandbox and return the preview URL"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value) -> Value {
        match self.agent.deploy_to_sandbox(None, false, None, false).await {
            Ok(result) => json!({"previewUrl": result.preview_url}),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct DeepDebugTool {
    agent: Arc<Orchestrator>,
    /// Once per conversation turn; the registry (and this counter) is
    /// rebuilt each turn.
    calls_this_turn: AtomicU32,
}

#[async_trait]
impl AgentTool for DeepDebugTool {
    fn name(&self) -> &str {
        "deep_debug"
    }

    fn description(&self) -> &str {
        "Run an isolated debugging session against the sandbox (once per turn)"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "issue": {"type": "string"},
                "focusPaths": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["issue"],
        })
    }

    async fn invoke(&self, args: Value) -> Value {
        if self.calls_this_turn.fetch_add(1, Ordering::SeqCst) >= 1 {
            return json!({"error": "CallLimitExceeded"});
        }
        let Some(issue) = args.get("issue").and_then(Value::as_str) else {
            return json!({"error": "missing issue"});
        };
        let focus_paths: Vec<String> = args
            .get("focusPaths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        match self.agent.deep_debug(issue, focus_paths).await {
            Ok(transcript) => json!({"transcript": transcript}),
            Err(AppError::GenerationInProgress) => json!({"error": "GENERATION_IN_PROGRESS"}),
            Err(AppError::DebugInProgress) => json!({"error": "DEBUG_IN_PROGRESS"}),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct WaitForGenerationTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for WaitForGenerationTool {
    fn name(&self) -> &str {
        "wait_for_generation"
    }

    fn description(&self) -> &str {
        "Wait until the current generation run completes"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value) -> Value {
        self.agent.wait_for_generation().await;
        json!({"generating": self.agent.is_code_generating()})
    }
}

struct ReadFilesTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for ReadFilesTool {
    fn name(&self) -> &str {
        "read_files"
    }

    fn description(&self) -> &str {
        "Read files from the sandbox filesystem"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"paths": {"type": "array", "items": {"type": "string"}}},
            "required": ["paths"],
        })
    }

    async fn invoke(&self, args: Value) -> Value {
        let paths: Vec<String> = args
            .get("paths")
            .and_then(Value::as_array)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        match self.agent.read_files(&paths).await {
            Ok(result) => serde_json::to_value(result.files).unwrap_or(Value::Null),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct ExecCommandsTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for ExecCommandsTool {
    fn name(&self) -> &str {
        "exec_commands"
    }

    fn description(&self) -> &str {
        "Execute shell commands in the sandbox"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"commands": {"type": "array", "items": {"type": "string"}}},
            "required": ["commands"],
        })
    }

    async fn invoke(&self, args: Value) -> Value {
        let cmds: Vec<String> = args
            .get("commands")
            .and_then(Value::as_array)
            .map(|cmds| {
                cmds.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        match self.agent.exec_commands(&cmds, false, None).await {
            Ok(successful) => json!({"succeeded": successful}),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

struct StaticAnalysisTool {
    agent: Arc<Orchestrator>,
}

#[async_trait]
impl AgentTool for StaticAnalysisTool {
    fn name(&self) -> &str {
        "run_static_analysis"
    }

    fn description(&self) -> &str {
        "Run lint and typecheck over the sandbox working tree"
    }

    fn schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(&self, _args: Value) -> Value {
        match self.agent.run_static_analysis_code(None).await {
            Ok(analysis) => serde_json::to_value(analysis).unwrap_or(Value::Null),
            Err(e) => json!({"error": e.to_string()}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customize_template_files() {
        let mut template = TemplateDetails {
            name: "react-vite-cf".to_string(),
            ..Default::default()
        };
        template.all_files.insert(
            "package.json".to_string(),
            r#"{"name": "template", "version": "0.0.1"}"#.to_string(),
        );
        template.all_files.insert(
            "wrangler.jsonc".to_string(),
            "{\n  // deploy config\n  \"name\": \"template\",\n  \"main\": \"src/index.ts\"\n}"
                .to_string(),
        );
        template
            .all_files
            .insert(".gitignore".to_string(), "node_modules\n".to_string());

        let files = customize_template_files(&template, "todo-app");
        let by_path: std::collections::BTreeMap<_, _> =
            files.iter().map(|f| (f.path.as_str(), f)).collect();

        assert!(by_path["package.json"].contents.contains("\"todo-app\""));
        assert!(by_path["wrangler.jsonc"]
            .contents
            .contains("\"name\": \"todo-app\""));
        assert!(by_path["wrangler.jsonc"].contents.contains("// deploy config"));
        assert!(by_path[".bootstrap.js"].contents.contains("execSync"));
        assert_eq!(by_path[".gitignore"].contents, "node_modules\n");
    }

    #[test]
    fn test_customize_handles_missing_template_files() {
        let template = TemplateDetails::default();
        let files = customize_template_files(&template, "todo-app");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, commands::BOOTSTRAP_PATH);
    }
}
