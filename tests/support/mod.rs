//! Shared test doubles: a prompt-routed mock inference provider, an
//! in-memory sandbox, registry, and cloud deploy, plus a fixture that wires
//! a full orchestrator against them.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use appforge::agent::orchestrator::{Orchestrator, OrchestratorDeps};
use appforge::models::state::TemplateDetails;
use appforge::services::deployment::{CloudDeploy, CloudDeployment};
use appforge::services::registry::{AppRecord, AppRegistry, AppUpdate};
use appforge::services::sandbox::{
    CommandOutcome, CommandsResult, DeployOptions, DeployResult, FileReadResult, InstanceStatus,
    LogsResult, RuntimeError, SandboxApi, SandboxFile, StaticAnalysis,
};
use appforge::utils::error::AppResult;
use appforge_core::context::{RuntimeContext, SystemClock};
use appforge_llm::{
    InferenceProvider, LlmError, LlmRequestOptions, LlmResponse, LlmResult, Message,
    ToolDefinition, UsageStats,
};

pub const DEFAULT_BLUEPRINT: &str = r#"{
    "title": "Todo",
    "description": "A todo application",
    "frameworks": ["react"],
    "implementationRoadmap": [{"phase": "Setup", "description": "scaffold"}],
    "initialPhase": {
        "name": "Setup",
        "description": "Scaffold the application shell",
        "files": [{"path": "src/App.tsx", "purpose": "app shell"}]
    }
}"#;

pub const DEFAULT_IMPLEMENTATION: &str = "<file path=\"src/App.tsx\" purpose=\"app shell\">\nexport default function App() { return null; }\n</file>";

/// Prompt-routed mock provider. Operations are recognized by their system
/// prompts, so concurrent background tasks cannot steal each other's
/// scripted replies.
#[derive(Default)]
pub struct MockProvider {
    pub blueprint_json: Mutex<Option<String>>,
    pub implementations: Mutex<VecDeque<String>>,
    pub phase_plans: Mutex<VecDeque<String>>,
    pub converse_replies: Mutex<VecDeque<LlmResponse>>,
    pub debug_replies: Mutex<VecDeque<LlmResponse>>,
    /// Implementation streams emit a chunk then park until cancelled.
    pub hang_on_implement: AtomicBool,
    /// Prompts seen by the debug route (for transcript-threading asserts).
    pub debug_prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_implementation(&self, body: &str) {
        self.implementations
            .lock()
            .unwrap()
            .push_back(body.to_string());
    }

    pub fn push_phase_plan(&self, json: &str) {
        self.phase_plans.lock().unwrap().push_back(json.to_string());
    }

    pub fn push_debug_reply(&self, response: LlmResponse) {
        self.debug_replies.lock().unwrap().push_back(response);
    }

    fn text(content: impl Into<String>) -> LlmResponse {
        LlmResponse {
            content: content.into(),
            tool_calls: Vec::new(),
            usage: UsageStats {
                input_tokens: 10,
                output_tokens: 10,
            },
            stop_reason: Some("stop".to_string()),
        }
    }

    fn route(&self, system: &Option<String>, messages: &[Message]) -> LlmResponse {
        let system = system.as_deref().unwrap_or_default();
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, appforge_llm::MessageRole::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if system.contains("planning a web application") {
            let blueprint = self
                .blueprint_json
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| DEFAULT_BLUEPRINT.to_string());
            return Self::text(blueprint);
        }
        if system.contains("plan the next implementation phase") {
            let plan = self
                .phase_plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| r#"{"phase": null}"#.to_string());
            return Self::text(plan);
        }
        if system.contains("implement one phase") {
            let body = self
                .implementations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| DEFAULT_IMPLEMENTATION.to_string());
            return Self::text(body);
        }
        if system.contains("rewrite one source file") {
            return Self::text("```\n// regenerated\nexport default function App() { return null; }\n```");
        }
        if system.contains("fix code issues across") {
            return Self::text("[]");
        }
        if system.contains("review one freshly generated") {
            // Echo the file back unchanged.
            let body = last_user
                .split("```")
                .nth(1)
                .map(|block| block.trim_start_matches('\n').to_string())
                .unwrap_or_default();
            return Self::text(format!("```\n{body}\n```"));
        }
        if system.contains("debugging assistant") {
            self.debug_prompts.lock().unwrap().push(last_user);
            return self
                .debug_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::text("Diagnosis: handler panics on empty input."));
        }
        if system.contains("assistant guiding") {
            return self
                .converse_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Self::text("Understood."));
        }
        if last_user.contains("List the shell commands") {
            return Self::text("[\"bun install\"]");
        }
        if last_user.contains("Write a concise README") {
            return Self::text("# Todo\nGenerated application.");
        }
        if last_user.contains("install commands failed") {
            return Self::text("[]");
        }
        Self::text("{}")
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        _tools: Vec<ToolDefinition>,
        _options: LlmRequestOptions,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse> {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        Ok(self.route(&system, &messages))
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        system: Option<String>,
        _tools: Vec<ToolDefinition>,
        _options: LlmRequestOptions,
        chunks: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> LlmResult<LlmResponse> {
        let is_implementation = system
            .as_deref()
            .is_some_and(|s| s.contains("implement one phase"));
        if is_implementation && self.hang_on_implement.load(Ordering::SeqCst) {
            let _ = chunks
                .send("<file path=\"src/App.tsx\" purpose=\"app shell\">\n".to_string())
                .await;
            let _ = chunks.send("const partial = 1;\n".to_string()).await;
            cancel.cancelled().await;
            return Err(LlmError::Cancelled);
        }

        let response = self.route(&system, &messages);
        let mut remaining = response.content.as_str();
        while !remaining.is_empty() {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
            let mut take = remaining.len().min(24);
            while !remaining.is_char_boundary(take) {
                take += 1;
            }
            let (piece, rest) = remaining.split_at(take);
            let _ = chunks.send(piece.to_string()).await;
            remaining = rest;
        }
        Ok(response)
    }
}

/// In-memory sandbox double.
#[derive(Default)]
pub struct MockSandbox {
    pub files: Mutex<BTreeMap<String, String>>,
    pub runtime_errors: Mutex<Vec<RuntimeError>>,
    pub analysis: Mutex<StaticAnalysis>,
    pub deploy_count: AtomicUsize,
    pub project_name: Mutex<Option<String>>,
    pub executed: Mutex<Vec<String>>,
}

impl MockSandbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            analysis: Mutex::new(StaticAnalysis {
                success: true,
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SandboxApi for MockSandbox {
    async fn deploy(
        &self,
        session_id: &str,
        files: Vec<SandboxFile>,
        options: DeployOptions,
    ) -> AppResult<DeployResult> {
        let mut fs = self.files.lock().unwrap();
        for file in files {
            fs.insert(file.path, file.contents);
        }
        let n = self.deploy_count.fetch_add(1, Ordering::SeqCst);
        let session = if options.redeploy {
            format!("{session_id}-r{n}")
        } else {
            session_id.to_string()
        };
        Ok(DeployResult {
            preview_url: format!("https://{session}.preview.test"),
            tunnel_url: None,
            session_id: session,
        })
    }

    async fn get_files(&self, _session_id: &str, paths: &[String]) -> AppResult<FileReadResult> {
        let fs = self.files.lock().unwrap();
        let files = paths
            .iter()
            .filter_map(|p| {
                fs.get(p).map(|contents| SandboxFile {
                    path: p.clone(),
                    contents: contents.clone(),
                })
            })
            .collect();
        Ok(FileReadResult {
            success: true,
            files,
            error: None,
        })
    }

    async fn write_files(
        &self,
        _session_id: &str,
        files: Vec<SandboxFile>,
        _message: &str,
    ) -> AppResult<()> {
        let mut fs = self.files.lock().unwrap();
        for file in files {
            fs.insert(file.path, file.contents);
        }
        Ok(())
    }

    async fn execute_commands(
        &self,
        _session_id: &str,
        commands: &[String],
        _timeout_ms: Option<u64>,
    ) -> AppResult<CommandsResult> {
        self.executed.lock().unwrap().extend(commands.iter().cloned());
        Ok(CommandsResult {
            success: true,
            results: commands
                .iter()
                .map(|c| CommandOutcome {
                    command: c.clone(),
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
                .collect(),
        })
    }

    async fn run_static_analysis(
        &self,
        _session_id: &str,
        _files: Option<Vec<String>>,
    ) -> AppResult<StaticAnalysis> {
        Ok(self.analysis.lock().unwrap().clone())
    }

    async fn fetch_runtime_errors(
        &self,
        _session_id: &str,
        clear: bool,
    ) -> AppResult<Vec<RuntimeError>> {
        let mut errors = self.runtime_errors.lock().unwrap();
        if clear {
            Ok(std::mem::take(&mut *errors))
        } else {
            Ok(errors.clone())
        }
    }

    async fn get_logs(
        &self,
        _session_id: &str,
        _reset: bool,
        _duration_seconds: Option<u32>,
    ) -> AppResult<LogsResult> {
        Ok(LogsResult {
            success: true,
            stdout: "server listening".to_string(),
            stderr: String::new(),
        })
    }

    async fn get_instance_status(&self, _session_id: &str) -> AppResult<InstanceStatus> {
        Ok(InstanceStatus {
            success: true,
            is_healthy: true,
        })
    }

    async fn update_project_name(&self, _session_id: &str, name: &str) -> AppResult<bool> {
        *self.project_name.lock().unwrap() = Some(name.to_string());
        Ok(true)
    }
}

/// In-memory registry double.
#[derive(Default)]
pub struct MockRegistry {
    pub apps: Mutex<BTreeMap<String, AppRecord>>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, id: &str) -> Option<AppRecord> {
        self.apps.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl AppRegistry for MockRegistry {
    async fn create_app(&self, record: AppRecord) -> AppResult<()> {
        self.apps.lock().unwrap().insert(record.id.clone(), record);
        Ok(())
    }

    async fn update_app(&self, id: &str, update: AppUpdate) -> AppResult<()> {
        let mut apps = self.apps.lock().unwrap();
        let record = apps.entry(id.to_string()).or_insert_with(|| AppRecord {
            id: id.to_string(),
            ..Default::default()
        });
        update.apply(record);
        Ok(())
    }

    async fn get_app_details(&self, id: &str) -> AppResult<Option<AppRecord>> {
        Ok(self.apps.lock().unwrap().get(id).cloned())
    }
}

pub struct MockCloud;

#[async_trait]
impl CloudDeploy for MockCloud {
    async fn deploy(&self, _session_id: &str, project_name: &str) -> AppResult<CloudDeployment> {
        Ok(CloudDeployment {
            deployment_id: "dep-test".to_string(),
            deployment_url: format!("https://{project_name}.workers.test"),
        })
    }
}

/// A fully wired orchestrator over the mocks.
pub struct Fixture {
    pub dir: TempDir,
    pub agent: Arc<Orchestrator>,
    pub provider: Arc<MockProvider>,
    pub sandbox: Arc<MockSandbox>,
    pub registry: Arc<MockRegistry>,
}

pub fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(
        appforge::storage::database::Database::open(dir.path().join("test.db")).unwrap(),
    );
    let provider = MockProvider::new();
    let sandbox = MockSandbox::new();
    let registry = MockRegistry::new();
    let runtime = RuntimeContext::new(
        Default::default(),
        Arc::new(SystemClock),
        Arc::new(appforge::utils::ids::UuidIdGen),
    );
    let agent = Orchestrator::new(OrchestratorDeps {
        db,
        project_id: "proj-test".to_string(),
        sandbox: sandbox.clone(),
        registry: registry.clone(),
        cloud: Arc::new(MockCloud),
        provider: provider.clone(),
        runtime,
        screenshots: None,
    })
    .unwrap();
    Fixture {
        dir,
        agent,
        provider,
        sandbox,
        registry,
    }
}

/// Template used across scenario tests.
pub fn template() -> TemplateDetails {
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
        "{\n  \"name\": \"template\"\n}".to_string(),
    );
    template.all_files.insert(
        "src/main.tsx".to_string(),
        "bootstrap();".to_string(),
    );
    template.all_files.insert(
        "src/App.tsx".to_string(),
        "export default function App() {}".to_string(),
    );
    template.important_files = vec!["src/App.tsx".to_string(), "src/main.tsx".to_string()];
    template
}

pub fn init_args(template: TemplateDetails) -> appforge::agent::orchestrator::InitializeArgs {
    appforge::agent::orchestrator::InitializeArgs {
        query: "build a todo app".to_string(),
        language: "typescript".to_string(),
        frameworks: vec!["react".to_string()],
        hostname: "todo.apps.test".to_string(),
        user_id: "user-1".to_string(),
        inference_context: json!({"agentId": "a1"}),
        template,
        images: Vec::new(),
    }
}

/// Drain all currently queued events from a receiver.
pub fn drain(
    receiver: &mut appforge::agent::broadcaster::ClientReceiver,
) -> Vec<appforge_core::events::AgentEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}

/// Await a specific event tag (with timeout), collecting everything seen.
pub async fn wait_for_tag(
    receiver: &mut appforge::agent::broadcaster::ClientReceiver,
    tag: &str,
    collected: &mut Vec<appforge_core::events::AgentEvent>,
) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        match tokio::time::timeout(remaining, receiver.recv()).await {
            Ok(Some(event)) => {
                let found = event.tag() == tag;
                collected.push(event);
                if found {
                    return true;
                }
            }
            Ok(None) => return false,
            Err(_) => return false,
        }
    }
}

/// Index of the first event with `tag`, for order assertions.
pub fn position(events: &[appforge_core::events::AgentEvent], tag: &str) -> Option<usize> {
    events.iter().position(|e| e.tag() == tag)
}
