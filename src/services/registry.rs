//! Application Registry Client
//!
//! Persistent app metadata lives in an external registry (title, status,
//! visibility, deployment id, screenshot URL). The orchestrator only needs
//! three calls, exposed behind a trait so tests can run against an in-memory
//! double.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::utils::error::{AppError, AppResult};

/// A registry row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRecord {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repository_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

/// Partial update applied to a registry row; `None` fields are untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repository_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_url: Option<String>,
}

impl AppUpdate {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    /// Apply this update to a record in place.
    pub fn apply(&self, record: &mut AppRecord) {
        if let Some(status) = &self.status {
            record.status = status.clone();
        }
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(url) = &self.github_repository_url {
            record.github_repository_url = Some(url.clone());
        }
        if let Some(visibility) = &self.visibility {
            record.visibility = visibility.clone();
        }
        if let Some(id) = &self.deployment_id {
            record.deployment_id = Some(id.clone());
        }
        if let Some(url) = &self.screenshot_url {
            record.screenshot_url = Some(url.clone());
        }
    }
}

/// Registry surface needed by the orchestrator.
#[async_trait]
pub trait AppRegistry: Send + Sync {
    async fn create_app(&self, record: AppRecord) -> AppResult<()>;
    async fn update_app(&self, id: &str, update: AppUpdate) -> AppResult<()>;
    async fn get_app_details(&self, id: &str) -> AppResult<Option<AppRecord>>;
}

/// HTTP implementation of [`AppRegistry`].
pub struct HttpAppRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAppRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AppRegistry for HttpAppRegistry {
    async fn create_app(&self, record: AppRecord) -> AppResult<()> {
        let resp = self
            .client
            .post(self.url("apps"))
            .json(&record)
            .send()
            .await
            .map_err(|e| AppError::internal(format!("registry createApp: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::internal(format!(
                "registry createApp: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn update_app(&self, id: &str, update: AppUpdate) -> AppResult<()> {
        let resp = self
            .client
            .post(self.url(&format!("apps/{id}")))
            .json(&json!({"update": update}))
            .send()
            .await
            .map_err(|e| AppError::internal(format!("registry updateApp: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::internal(format!(
                "registry updateApp: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get_app_details(&self, id: &str) -> AppResult<Option<AppRecord>> {
        let resp = self
            .client
            .get(self.url(&format!("apps/{id}")))
            .send()
            .await
            .map_err(|e| AppError::internal(format!("registry getAppDetails: {e}")))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(AppError::internal(format!(
                "registry getAppDetails: HTTP {}",
                resp.status()
            )));
        }
        let record = resp
            .json::<AppRecord>()
            .await
            .map_err(|e| AppError::internal(format!("registry getAppDetails: {e}")))?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_apply_is_partial() {
        let mut record = AppRecord {
            id: "app-1".to_string(),
            title: "todo-app".to_string(),
            status: "generating".to_string(),
            visibility: "private".to_string(),
            ..Default::default()
        };
        AppUpdate::status("completed").apply(&mut record);
        assert_eq!(record.status, "completed");
        assert_eq!(record.title, "todo-app");

        AppUpdate::title("my-app_1").apply(&mut record);
        assert_eq!(record.title, "my-app_1");
        assert_eq!(record.status, "completed");
    }

    #[test]
    fn test_update_serialization_skips_none() {
        let json = serde_json::to_string(&AppUpdate::status("completed")).unwrap();
        assert!(json.contains("status"));
        assert!(!json.contains("screenshotUrl"));
    }
}
