//! Sandbox Client
//!
//! Typed façade over the external sandbox execution service: file I/O,
//! command execution, static analysis, runtime-error capture, logs, and
//! deploys with preview URLs. The `SandboxApi` trait is the seam; the HTTP
//! implementation talks JSON-over-POST to the service, and tests plug an
//! in-memory double into the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::utils::error::{AppError, AppResult};

/// A file written to or read from the sandbox filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxFile {
    pub path: String,
    pub contents: String,
}

/// Deploy options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOptions {
    /// Allocate a fresh session (rotates the session id, invalidating the
    /// previous preview URL).
    #[serde(default)]
    pub redeploy: bool,
    #[serde(default)]
    pub clear_logs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

/// Deploy outcome. `session_id` echoes the effective session, which differs
/// from the request's when `redeploy` allocated a fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub session_id: String,
    pub preview_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,
}

/// Result of reading files from the sandbox filesystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReadResult {
    pub success: bool,
    #[serde(default)]
    pub files: Vec<SandboxFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of one executed command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub command: String,
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Outcome of a command batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandsResult {
    pub success: bool,
    #[serde(default)]
    pub results: Vec<CommandOutcome>,
}

/// A lint or typecheck finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
    /// Tool-specific issue code, e.g. `TS2307`.
    #[serde(default)]
    pub code: String,
}

impl AnalysisIssue {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            file_path: None,
            line: None,
            message: message.into(),
            code: code.into(),
        }
    }

    pub fn at(mut self, path: impl Into<String>, line: u32) -> Self {
        self.file_path = Some(path.into());
        self.line = Some(line);
        self
    }
}

/// One analysis lane's findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueSet {
    #[serde(default)]
    pub issues: Vec<AnalysisIssue>,
}

/// Static analysis over the sandbox working tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticAnalysis {
    pub success: bool,
    #[serde(default)]
    pub lint: IssueSet,
    #[serde(default)]
    pub typecheck: IssueSet,
}

impl StaticAnalysis {
    pub fn issue_count(&self) -> usize {
        self.lint.issues.len() + self.typecheck.issues.len()
    }
}

/// A captured runtime error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Cumulative (or reset) process logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResult {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Health of a sandbox instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub success: bool,
    #[serde(default)]
    pub is_healthy: bool,
}

/// Typed RPC surface of the sandbox execution service.
#[async_trait]
pub trait SandboxApi: Send + Sync {
    /// Deploy files; may allocate a fresh session on `redeploy`.
    async fn deploy(
        &self,
        session_id: &str,
        files: Vec<SandboxFile>,
        options: DeployOptions,
    ) -> AppResult<DeployResult>;

    /// Read files from the sandbox filesystem.
    async fn get_files(&self, session_id: &str, paths: &[String]) -> AppResult<FileReadResult>;

    /// Write files to the sandbox filesystem.
    async fn write_files(
        &self,
        session_id: &str,
        files: Vec<SandboxFile>,
        message: &str,
    ) -> AppResult<()>;

    /// Execute shell commands sequentially.
    async fn execute_commands(
        &self,
        session_id: &str,
        commands: &[String],
        timeout_ms: Option<u64>,
    ) -> AppResult<CommandsResult>;

    /// Lint + typecheck the working tree (optionally scoped to `files`).
    async fn run_static_analysis(
        &self,
        session_id: &str,
        files: Option<Vec<String>>,
    ) -> AppResult<StaticAnalysis>;

    /// Captured runtime errors; with `clear`, the buffer drains.
    async fn fetch_runtime_errors(
        &self,
        session_id: &str,
        clear: bool,
    ) -> AppResult<Vec<RuntimeError>>;

    /// Process logs, cumulative unless `reset`.
    async fn get_logs(
        &self,
        session_id: &str,
        reset: bool,
        duration_seconds: Option<u32>,
    ) -> AppResult<LogsResult>;

    /// Instance health probe.
    async fn get_instance_status(&self, session_id: &str) -> AppResult<InstanceStatus>;

    /// Propagate a project rename into the sandbox.
    async fn update_project_name(&self, session_id: &str, name: &str) -> AppResult<bool>;
}

/// HTTP implementation of [`SandboxApi`].
pub struct HttpSandboxClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSandboxClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        op: &str,
        body: serde_json::Value,
    ) -> AppResult<T> {
        let url = format!("{}/api/{op}", self.base_url.trim_end_matches('/'));
        debug!(%url, "sandbox rpc");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::sandbox(format!("{op}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::sandbox(format!("{op}: HTTP {status}: {text}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| AppError::sandbox(format!("{op}: bad response: {e}")))
    }
}

#[async_trait]
impl SandboxApi for HttpSandboxClient {
    async fn deploy(
        &self,
        session_id: &str,
        files: Vec<SandboxFile>,
        options: DeployOptions,
    ) -> AppResult<DeployResult> {
        self.post(
            "deploy",
            json!({"sessionId": session_id, "files": files, "options": options}),
        )
        .await
    }

    async fn get_files(&self, session_id: &str, paths: &[String]) -> AppResult<FileReadResult> {
        self.post(
            "files/get",
            json!({"sessionId": session_id, "paths": paths}),
        )
        .await
    }

    async fn write_files(
        &self,
        session_id: &str,
        files: Vec<SandboxFile>,
        message: &str,
    ) -> AppResult<()> {
        let _: serde_json::Value = self
            .post(
                "files/write",
                json!({"sessionId": session_id, "files": files, "message": message}),
            )
            .await?;
        Ok(())
    }

    async fn execute_commands(
        &self,
        session_id: &str,
        commands: &[String],
        timeout_ms: Option<u64>,
    ) -> AppResult<CommandsResult> {
        self.post(
            "commands/execute",
            json!({"sessionId": session_id, "commands": commands, "timeoutMs": timeout_ms}),
        )
        .await
    }

    async fn run_static_analysis(
        &self,
        session_id: &str,
        files: Option<Vec<String>>,
    ) -> AppResult<StaticAnalysis> {
        self.post(
            "analysis/run",
            json!({"sessionId": session_id, "files": files}),
        )
        .await
    }

    async fn fetch_runtime_errors(
        &self,
        session_id: &str,
        clear: bool,
    ) -> AppResult<Vec<RuntimeError>> {
        self.post(
            "errors/runtime",
            json!({"sessionId": session_id, "clear": clear}),
        )
        .await
    }

    async fn get_logs(
        &self,
        session_id: &str,
        reset: bool,
        duration_seconds: Option<u32>,
    ) -> AppResult<LogsResult> {
        self.post(
            "logs/get",
            json!({"sessionId": session_id, "reset": reset, "durationSeconds": duration_seconds}),
        )
        .await
    }

    async fn get_instance_status(&self, session_id: &str) -> AppResult<InstanceStatus> {
        self.post("instance/status", json!({"sessionId": session_id}))
            .await
    }

    async fn update_project_name(&self, session_id: &str, name: &str) -> AppResult<bool> {
        #[derive(Deserialize)]
        struct RenameAck {
            #[serde(default)]
            success: bool,
        }
        let ack: RenameAck = self
            .post(
                "project/name",
                json!({"sessionId": session_id, "name": name}),
            )
            .await?;
        Ok(ack.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_options_serialization() {
        let options = DeployOptions {
            redeploy: true,
            clear_logs: false,
            commit_message: Some("Phase 1: API".to_string()),
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["redeploy"], true);
        assert_eq!(json["commitMessage"], "Phase 1: API");
    }

    #[test]
    fn test_analysis_issue_builder() {
        let issue = AnalysisIssue::new("Cannot find module 'zod'", "TS2307").at("src/api.ts", 3);
        assert_eq!(issue.code, "TS2307");
        assert_eq!(issue.file_path.as_deref(), Some("src/api.ts"));
    }

    #[test]
    fn test_static_analysis_issue_count() {
        let analysis = StaticAnalysis {
            success: true,
            lint: IssueSet {
                issues: vec![AnalysisIssue::new("unused", "no-unused-vars")],
            },
            typecheck: IssueSet {
                issues: vec![
                    AnalysisIssue::new("missing module", "TS2307"),
                    AnalysisIssue::new("unused import", "TS6133"),
                ],
            },
        };
        assert_eq!(analysis.issue_count(), 3);
    }

    #[test]
    fn test_deploy_result_parses_without_tunnel() {
        let result: DeployResult = serde_json::from_str(
            r#"{"sessionId":"s1","previewUrl":"https://preview.example.com"}"#,
        )
        .unwrap();
        assert!(result.tunnel_url.is_none());
    }
}
