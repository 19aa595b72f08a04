//! GitHub Export
//!
//! Exports the version store's history to a GitHub repository: a commit
//! graph is assembled atop a template base commit whose author date equals
//! the project's creation time, then pushed to `main` via the REST API
//! (inline-content trees, commit objects, ref update).
//!
//! The access token is cached in memory with a TTL and never persisted.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use appforge_core::context::Clock;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::services::git_store::{CommitInfo, GitStore};
use crate::utils::error::{AppError, AppResult};

/// Token cache TTL: one hour.
const TOKEN_TTL_MILLIS: i64 = 60 * 60 * 1000;

/// Caller-supplied push parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushOptions {
    /// Access token; omitted calls reuse the cached token while it is fresh.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub username: String,
    pub email: String,
    pub repository_html_url: String,
    #[serde(default)]
    pub is_private: bool,
}

/// Successful push outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub commit_sha: String,
    pub repository_url: String,
}

/// One commit to create remotely: a full tree snapshot plus metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlanEntry {
    pub message: String,
    /// Unix millis used as both author and committer date.
    pub timestamp: i64,
    pub files: BTreeMap<String, String>,
}

/// Assemble the commit graph to push: the template base first (author date
/// = project creation time), then every stored commit oldest-first, each as
/// a full snapshot of template ∪ files-at-commit.
pub fn assemble_commit_plan(
    template_files: &BTreeMap<String, String>,
    history: &[(CommitInfo, BTreeMap<String, String>)],
    created_at: i64,
    query: &str,
) -> Vec<CommitPlanEntry> {
    let mut plan = Vec::with_capacity(history.len() + 1);
    plan.push(CommitPlanEntry {
        message: format!("Template base for: {query}"),
        timestamp: created_at,
        files: template_files.clone(),
    });
    for (info, files) in history {
        let mut snapshot = template_files.clone();
        for (path, contents) in files {
            snapshot.insert(path.clone(), contents.clone());
        }
        plan.push(CommitPlanEntry {
            message: info.message.clone(),
            timestamp: info.timestamp,
            files: snapshot,
        });
    }
    plan
}

/// Split `https://github.com/{owner}/{repo}` into its parts.
pub fn parse_repository_url(html_url: &str) -> AppResult<(String, String)> {
    let trimmed = html_url
        .trim_end_matches('/')
        .trim_end_matches(".git");
    let mut segments = trimmed.rsplit('/');
    let repo = segments.next().unwrap_or_default();
    let owner = segments.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() {
        return Err(AppError::validation(format!(
            "unrecognized repository URL: {html_url}"
        )));
    }
    Ok((owner.to_string(), repo.to_string()))
}

struct CachedToken {
    token: String,
    cached_at: i64,
}

/// GitHub REST exporter.
pub struct GithubExporter {
    client: reqwest::Client,
    api_base: String,
    clock: Arc<dyn Clock>,
    token_cache: Mutex<Option<CachedToken>>,
}

impl GithubExporter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_api_base("https://api.github.com", clock)
    }

    pub fn with_api_base(api_base: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.into(),
            clock,
            token_cache: Mutex::new(None),
        }
    }

    /// Resolve the token to use: a provided token refreshes the cache, an
    /// omitted one falls back to a still-fresh cached token.
    pub fn resolve_token(&self, provided: Option<String>) -> AppResult<String> {
        let now = self.clock.now_millis();
        let mut cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = provided {
            *cache = Some(CachedToken {
                token: token.clone(),
                cached_at: now,
            });
            return Ok(token);
        }
        match cache.as_ref() {
            Some(cached) if now - cached.cached_at < TOKEN_TTL_MILLIS => Ok(cached.token.clone()),
            _ => Err(AppError::validation(
                "no GitHub token provided and cached token expired",
            )),
        }
    }

    /// Push the full history. `progress` receives step labels with a 0-100
    /// completion estimate.
    pub async fn push(
        &self,
        git: &GitStore,
        template_files: &BTreeMap<String, String>,
        created_at: i64,
        query: &str,
        options: PushOptions,
        progress: impl Fn(&str, u8),
    ) -> AppResult<PushResult> {
        let token = self.resolve_token(options.token.clone())?;
        let (owner, repo) = parse_repository_url(&options.repository_html_url)?;

        progress("exporting objects", 5);
        let mut history = Vec::new();
        let mut log = git.log(usize::MAX)?;
        log.reverse();
        for info in log {
            let files = git.files_at(&info.oid)?;
            history.push((info, files));
        }
        let plan = assemble_commit_plan(template_files, &history, created_at, query);

        progress("assembling commit graph", 15);
        let total = plan.len();
        let mut parent: Option<String> = None;
        for (index, entry) in plan.iter().enumerate() {
            let sha = self
                .create_remote_commit(&token, &owner, &repo, entry, parent.as_deref(), &options)
                .await?;
            parent = Some(sha);
            let pct = 15 + (index + 1) * 75 / total.max(1);
            progress(&format!("pushed commit {}/{total}", index + 1), pct as u8);
        }

        let head = parent.ok_or_else(|| AppError::internal("empty commit plan"))?;
        progress("updating main", 95);
        self.update_main_ref(&token, &owner, &repo, &head).await?;
        info!(owner, repo, sha = %head, "GitHub export complete");

        Ok(PushResult {
            commit_sha: head,
            repository_url: options.repository_html_url,
        })
    }

    async fn create_remote_commit(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        entry: &CommitPlanEntry,
        parent: Option<&str>,
        options: &PushOptions,
    ) -> AppResult<String> {
        let tree_entries: Vec<Value> = entry
            .files
            .iter()
            .map(|(path, contents)| {
                json!({"path": path, "mode": "100644", "type": "blob", "content": contents})
            })
            .collect();
        let tree: Value = self
            .api_post(
                token,
                &format!("repos/{owner}/{repo}/git/trees"),
                json!({"tree": tree_entries}),
            )
            .await?;
        let tree_sha = tree["sha"]
            .as_str()
            .ok_or_else(|| AppError::internal("tree response missing sha"))?;

        let author = json!({
            "name": options.username,
            "email": options.email,
            "date": iso8601(entry.timestamp),
        });
        let parents: Vec<&str> = parent.into_iter().collect();
        let commit: Value = self
            .api_post(
                token,
                &format!("repos/{owner}/{repo}/git/commits"),
                json!({
                    "message": entry.message,
                    "tree": tree_sha,
                    "parents": parents,
                    "author": author,
                    "committer": author,
                }),
            )
            .await?;
        let sha = commit["sha"]
            .as_str()
            .ok_or_else(|| AppError::internal("commit response missing sha"))?;
        debug!(sha, message = %entry.message, "created remote commit");
        Ok(sha.to_string())
    }

    async fn update_main_ref(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> AppResult<()> {
        // Try updating the existing ref; a missing ref is created instead.
        let patch_url = format!(
            "{}/repos/{owner}/{repo}/git/refs/heads/main",
            self.api_base.trim_end_matches('/')
        );
        let resp = self
            .client
            .patch(&patch_url)
            .bearer_auth(token)
            .header("user-agent", "appforge")
            .json(&json!({"sha": sha, "force": true}))
            .send()
            .await
            .map_err(|e| AppError::internal(format!("ref update: {e}")))?;
        if resp.status().is_success() {
            return Ok(());
        }
        let _: Value = self
            .api_post(
                token,
                &format!("repos/{owner}/{repo}/git/refs"),
                json!({"ref": "refs/heads/main", "sha": sha}),
            )
            .await?;
        Ok(())
    }

    async fn api_post(&self, token: &str, path: &str, body: Value) -> AppResult<Value> {
        let url = format!("{}/{path}", self.api_base.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("user-agent", "appforge")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::internal(format!("github {path}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AppError::internal(format!(
                "github {path}: HTTP {status}: {text}"
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AppError::internal(format!("github {path}: bad response: {e}")))
    }
}

fn iso8601(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use appforge_core::context::SystemClock;

    #[test]
    fn test_parse_repository_url() {
        let (owner, repo) =
            parse_repository_url("https://github.com/acme/todo-app").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "todo-app");

        let (owner, repo) =
            parse_repository_url("https://github.com/acme/todo-app.git/").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(repo, "todo-app");
    }

    #[test]
    fn test_empty_repo_plan_is_single_template_base() {
        let mut template = BTreeMap::new();
        template.insert("package.json".to_string(), "{}".to_string());

        let plan = assemble_commit_plan(&template, &[], 1_700_000_000_000, "build a todo app");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].timestamp, 1_700_000_000_000);
        assert!(plan[0].message.contains("build a todo app"));
        assert_eq!(plan[0].files, template);
    }

    #[test]
    fn test_plan_overlays_generated_files_on_template() {
        let mut template = BTreeMap::new();
        template.insert("package.json".to_string(), "{}".to_string());
        template.insert("src/main.tsx".to_string(), "bootstrap()".to_string());

        let mut commit_files = BTreeMap::new();
        commit_files.insert("src/main.tsx".to_string(), "custom()".to_string());
        commit_files.insert("src/App.tsx".to_string(), "app".to_string());

        let history = vec![(
            CommitInfo {
                oid: "c1".to_string(),
                message: "Setup".to_string(),
                timestamp: 1_700_000_100_000,
                author: "appforge".to_string(),
            },
            commit_files,
        )];
        let plan = assemble_commit_plan(&template, &history, 1_700_000_000_000, "q");
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].files["src/main.tsx"], "custom()");
        assert_eq!(plan[1].files["package.json"], "{}");
        assert_eq!(plan[1].files["src/App.tsx"], "app");
    }

    #[test]
    fn test_token_cache_respects_ttl() {
        struct SteppingClock(std::sync::atomic::AtomicI64);
        impl Clock for SteppingClock {
            fn now_millis(&self) -> i64 {
                self.0.load(std::sync::atomic::Ordering::SeqCst)
            }
        }

        let clock = Arc::new(SteppingClock(std::sync::atomic::AtomicI64::new(0)));
        let exporter = GithubExporter::with_api_base("http://localhost", Arc::clone(&clock) as _);

        assert!(exporter.resolve_token(None).is_err());
        assert_eq!(
            exporter.resolve_token(Some("tok-1".to_string())).unwrap(),
            "tok-1"
        );
        // Within TTL the cached token serves omitted calls.
        clock.0.store(TOKEN_TTL_MILLIS - 1, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(exporter.resolve_token(None).unwrap(), "tok-1");
        // Past TTL it expires.
        clock.0.store(TOKEN_TTL_MILLIS + 1, std::sync::atomic::Ordering::SeqCst);
        assert!(exporter.resolve_token(None).is_err());
    }

    #[test]
    fn test_iso8601_format() {
        let date = iso8601(0);
        assert!(date.starts_with("1970-01-01T00:00:00"));
        let _ = GithubExporter::new(Arc::new(SystemClock));
    }
}
