//! Deployment Manager
//!
//! Owns the sandbox session lifecycle and the preview URL cache, and drives
//! deploy-to-cloud. A `redeploy` allocates a fresh sandbox session, which
//! invalidates the cached preview URL; the new session id is persisted back
//! into the project document.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::sandbox::{DeployOptions, DeployResult, SandboxApi, SandboxFile};
use crate::storage::store::Store;
use crate::utils::error::{AppError, AppResult};

/// A finished cloud deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDeployment {
    pub deployment_id: String,
    pub deployment_url: String,
}

/// Cloud deploy seam (the production implementation talks to the deploy
/// pipeline; tests use a canned double).
#[async_trait]
pub trait CloudDeploy: Send + Sync {
    async fn deploy(&self, session_id: &str, project_name: &str) -> AppResult<CloudDeployment>;
}

/// HTTP implementation of [`CloudDeploy`].
pub struct HttpCloudDeploy {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCloudDeploy {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CloudDeploy for HttpCloudDeploy {
    async fn deploy(&self, session_id: &str, project_name: &str) -> AppResult<CloudDeployment> {
        let url = format!("{}/deploy", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .json(&json!({"sessionId": session_id, "projectName": project_name}))
            .send()
            .await
            .map_err(|e| AppError::sandbox(format!("cloud deploy: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::sandbox(format!(
                "cloud deploy: HTTP {}",
                resp.status()
            )));
        }
        resp.json::<CloudDeployment>()
            .await
            .map_err(|e| AppError::sandbox(format!("cloud deploy: bad response: {e}")))
    }
}

/// Sandbox session lifecycle + preview URL cache.
pub struct DeploymentManager {
    sandbox: Arc<dyn SandboxApi>,
    cloud: Arc<dyn CloudDeploy>,
    preview: Mutex<Option<DeployResult>>,
}

impl DeploymentManager {
    pub fn new(sandbox: Arc<dyn SandboxApi>, cloud: Arc<dyn CloudDeploy>) -> Self {
        Self {
            sandbox,
            cloud,
            preview: Mutex::new(None),
        }
    }

    /// The session id from the project document, allocating and persisting
    /// one when absent.
    pub fn ensure_session(&self, store: &Store) -> AppResult<String> {
        let existing = store.snapshot().session_id;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let session_id = Uuid::new_v4().to_string();
        store.mutate(|s| s.session_id = session_id.clone())?;
        info!(session_id = %session_id, "allocated sandbox session");
        Ok(session_id)
    }

    /// Deploy files to the sandbox. On `redeploy` the previous preview URL
    /// is invalidated before the call and the (possibly rotated) session id
    /// is persisted after it.
    pub async fn deploy(
        &self,
        store: &Store,
        files: Vec<SandboxFile>,
        options: DeployOptions,
    ) -> AppResult<DeployResult> {
        let session_id = self.ensure_session(store)?;
        if options.redeploy {
            self.invalidate_preview();
        }

        let result = self.sandbox.deploy(&session_id, files, options).await?;
        if result.session_id != session_id {
            info!(
                old = %session_id,
                new = %result.session_id,
                "sandbox session rotated"
            );
            store.mutate(|s| {
                s.session_id = result.session_id.clone();
                s.sandbox_instance_id = Some(result.session_id.clone());
            })?;
        }

        *self.preview.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
        Ok(result)
    }

    /// The most recent deploy result, if the preview is still considered
    /// valid.
    pub fn cached_preview(&self) -> Option<DeployResult> {
        self.preview
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invalidate_preview(&self) {
        *self.preview.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Probe instance health; unhealthy sessions get one redeploy attempt by
    /// the caller.
    pub async fn is_healthy(&self, store: &Store) -> bool {
        let Ok(session_id) = self.ensure_session(store) else {
            return false;
        };
        match self.sandbox.get_instance_status(&session_id).await {
            Ok(status) => status.is_healthy,
            Err(e) => {
                warn!(error = %e, "instance status probe failed");
                false
            }
        }
    }

    /// Run the cloud deploy for the current session.
    pub async fn deploy_to_cloud(&self, store: &Store) -> AppResult<CloudDeployment> {
        let session_id = self.ensure_session(store)?;
        let project_name = store.snapshot().project_name;
        self.cloud.deploy(&session_id, &project_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::ProjectState;
    use crate::services::sandbox::{
        CommandsResult, FileReadResult, InstanceStatus, LogsResult, RuntimeError, StaticAnalysis,
    };
    use crate::storage::database::Database;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct FakeSandbox {
        rotate: AtomicBool,
    }

    #[async_trait]
    impl SandboxApi for FakeSandbox {
        async fn deploy(
            &self,
            session_id: &str,
            _files: Vec<SandboxFile>,
            options: DeployOptions,
        ) -> AppResult<DeployResult> {
            let session = if options.redeploy && self.rotate.load(Ordering::SeqCst) {
                format!("{session_id}-rotated")
            } else {
                session_id.to_string()
            };
            Ok(DeployResult {
                preview_url: format!("https://{session}.preview.example.com"),
                tunnel_url: None,
                session_id: session,
            })
        }

        async fn get_files(&self, _: &str, _: &[String]) -> AppResult<FileReadResult> {
            Ok(FileReadResult::default())
        }

        async fn write_files(&self, _: &str, _: Vec<SandboxFile>, _: &str) -> AppResult<()> {
            Ok(())
        }

        async fn execute_commands(
            &self,
            _: &str,
            _: &[String],
            _: Option<u64>,
        ) -> AppResult<CommandsResult> {
            Ok(CommandsResult::default())
        }

        async fn run_static_analysis(
            &self,
            _: &str,
            _: Option<Vec<String>>,
        ) -> AppResult<StaticAnalysis> {
            Ok(StaticAnalysis::default())
        }

        async fn fetch_runtime_errors(&self, _: &str, _: bool) -> AppResult<Vec<RuntimeError>> {
            Ok(Vec::new())
        }

        async fn get_logs(&self, _: &str, _: bool, _: Option<u32>) -> AppResult<LogsResult> {
            Ok(LogsResult::default())
        }

        async fn get_instance_status(&self, _: &str) -> AppResult<InstanceStatus> {
            Ok(InstanceStatus {
                success: true,
                is_healthy: true,
            })
        }

        async fn update_project_name(&self, _: &str, _: &str) -> AppResult<bool> {
            Ok(true)
        }
    }

    struct FakeCloud;

    #[async_trait]
    impl CloudDeploy for FakeCloud {
        async fn deploy(
            &self,
            _session_id: &str,
            project_name: &str,
        ) -> AppResult<CloudDeployment> {
            Ok(CloudDeployment {
                deployment_id: "dep-1".to_string(),
                deployment_url: format!("https://{project_name}.workers.example.com"),
            })
        }
    }

    fn fixture(rotate: bool) -> (TempDir, Arc<Store>, DeploymentManager) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("test.db")).unwrap());
        let store =
            Arc::new(Store::load_or_init(db, "proj-1", ProjectState::default()).unwrap());
        let manager = DeploymentManager::new(
            Arc::new(FakeSandbox {
                rotate: AtomicBool::new(rotate),
            }),
            Arc::new(FakeCloud),
        );
        (dir, store, manager)
    }

    #[tokio::test]
    async fn test_session_allocated_once() {
        let (_dir, store, manager) = fixture(false);
        let first = manager.ensure_session(&store).unwrap();
        let second = manager.ensure_session(&store).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.snapshot().session_id, first);
    }

    #[tokio::test]
    async fn test_deploy_caches_preview() {
        let (_dir, store, manager) = fixture(false);
        let result = manager
            .deploy(&store, Vec::new(), DeployOptions::default())
            .await
            .unwrap();
        assert_eq!(manager.cached_preview().unwrap(), result);
    }

    #[tokio::test]
    async fn test_redeploy_rotates_session_and_invalidates_preview() {
        let (_dir, store, manager) = fixture(true);
        manager
            .deploy(&store, Vec::new(), DeployOptions::default())
            .await
            .unwrap();
        let original = store.snapshot().session_id;

        let result = manager
            .deploy(
                &store,
                Vec::new(),
                DeployOptions {
                    redeploy: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_ne!(result.session_id, original);
        assert_eq!(store.snapshot().session_id, result.session_id);
        assert!(manager
            .cached_preview()
            .unwrap()
            .preview_url
            .contains("rotated"));
    }

    #[tokio::test]
    async fn test_cloud_deploy_uses_project_name() {
        let (_dir, store, manager) = fixture(false);
        store
            .mutate(|s| s.project_name = "todo-app".to_string())
            .unwrap();
        let deployment = manager.deploy_to_cloud(&store).await.unwrap();
        assert_eq!(deployment.deployment_id, "dep-1");
        assert!(deployment.deployment_url.contains("todo-app"));
    }
}
