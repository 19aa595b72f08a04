//! File Manager
//!
//! Merges template and generated files into the union view handed to
//! operations and the sandbox, computes per-file diffs on save, and rebuilds
//! the generated map from the version store's `HEAD` when it moves.
//! Generated files override template files of the same path.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use appforge_core::context::Clock;
use tracing::debug;

use crate::models::phase::GeneratedFile;
use crate::models::state::TemplateDetails;
use crate::services::git_store::{unified_diff, FileBlob, GitStore};
use crate::storage::store::Store;
use crate::utils::error::AppResult;

/// Replacement body for redacted template files.
pub const REDACTION_MARKER: &str = "/* contents redacted */";

/// Union view over template and generated files.
pub struct FileManager {
    store: Arc<Store>,
    git: Arc<GitStore>,
    template: Arc<RwLock<TemplateDetails>>,
    clock: Arc<dyn Clock>,
}

impl FileManager {
    pub fn new(
        store: Arc<Store>,
        git: Arc<GitStore>,
        template: Arc<RwLock<TemplateDetails>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            git,
            template,
            clock,
        }
    }

    /// Full union: template ∪ generated, generated wins on collision.
    pub fn get_all_files(&self) -> BTreeMap<String, String> {
        let template = self.template.read().unwrap_or_else(|e| e.into_inner());
        let mut files = template.all_files.clone();
        drop(template);
        for (path, file) in self.store.snapshot().generated_files_map {
            files.insert(path, file.contents);
        }
        files
    }

    /// Model-context union: important template files ∪ generated. With
    /// `redact`, template files on the redaction list carry a marker body.
    pub fn get_all_relevant_files(&self, redact: bool) -> BTreeMap<String, String> {
        let template = self.template.read().unwrap_or_else(|e| e.into_inner());
        let mut files = BTreeMap::new();
        for path in &template.important_files {
            if let Some(contents) = template.all_files.get(path) {
                let redacted = redact && template.redacted_files.contains(path);
                files.insert(
                    path.clone(),
                    if redacted {
                        REDACTION_MARKER.to_string()
                    } else {
                        contents.clone()
                    },
                );
            }
        }
        drop(template);
        for (path, file) in self.store.snapshot().generated_files_map {
            files.insert(path, file.contents);
        }
        files
    }

    /// Save generated files: compute each file's diff against the prior
    /// contents (fallback base: template contents or empty), update the
    /// store, then stage or commit depending on whether a commit message was
    /// provided. Returns the saved files with diffs filled in.
    pub fn save_generated_files(
        &self,
        files: Vec<GeneratedFile>,
        commit_message: Option<&str>,
    ) -> AppResult<Vec<GeneratedFile>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.store.snapshot();
        let template = self.template.read().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now_millis();

        let saved: Vec<GeneratedFile> = files
            .into_iter()
            .map(|mut file| {
                let previous = state
                    .generated_files_map
                    .get(&file.path)
                    .map(|f| f.contents.clone())
                    .or_else(|| template.all_files.get(&file.path).cloned())
                    .unwrap_or_default();
                file.last_diff = unified_diff(&previous, &file.contents, &file.path);
                file.last_modified = now;
                if file.purpose.is_empty() {
                    if let Some(prior) = state.generated_files_map.get(&file.path) {
                        file.purpose = prior.purpose.clone();
                    }
                }
                file
            })
            .collect();
        drop(template);

        self.store.mutate(|s| {
            for file in &saved {
                s.generated_files_map.insert(file.path.clone(), file.clone());
            }
        })?;

        let blobs: Vec<FileBlob> = saved
            .iter()
            .map(|f| FileBlob::new(f.path.clone(), f.contents.clone()))
            .collect();
        match commit_message {
            Some(message) => {
                self.git.commit(&blobs, message)?;
            }
            None => self.git.stage(&blobs),
        }

        debug!(count = saved.len(), committed = commit_message.is_some(), "saved generated files");
        Ok(saved)
    }

    /// Hard-delete files from the store and the version store. Sandbox
    /// deletion is a separate step owned by the caller.
    pub fn delete_files(&self, paths: &[String]) -> AppResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        self.store.mutate(|s| {
            for path in paths {
                s.generated_files_map.remove(path);
            }
        })?;
        self.git.stage_removals(paths);
        self.git.commit(&[], &format!("Delete {} file(s)", paths.len()))?;
        Ok(())
    }

    /// Rebuild `generated_files_map` from the version store's `HEAD`,
    /// preserving `purpose` (and unchanged files' diffs) from the prior map.
    pub fn sync_from_head(&self) -> AppResult<()> {
        let head = self.git.head_files()?;
        self.store.mutate(|s| {
            let prior = std::mem::take(&mut s.generated_files_map);
            let mut rebuilt = BTreeMap::new();
            for (path, contents) in head {
                let mut file = GeneratedFile::new(path.clone(), contents);
                if let Some(previous) = prior.get(&path) {
                    file.purpose = previous.purpose.clone();
                    if previous.contents == file.contents {
                        file.last_diff = previous.last_diff.clone();
                        file.last_modified = previous.last_modified;
                    }
                }
                rebuilt.insert(path, file);
            }
            s.generated_files_map = rebuilt;
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::ProjectState;
    use crate::storage::database::Database;
    use appforge_core::context::SystemClock;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<Store>, Arc<GitStore>, FileManager) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("test.db")).unwrap());
        let store = Arc::new(
            Store::load_or_init(Arc::clone(&db), "proj-1", ProjectState::default()).unwrap(),
        );
        let git = Arc::new(GitStore::new(db, Arc::new(SystemClock), "appforge"));
        let mut template = TemplateDetails {
            name: "react-vite-cf".to_string(),
            ..Default::default()
        };
        template
            .all_files
            .insert("src/main.tsx".to_string(), "bootstrap()".to_string());
        template
            .all_files
            .insert("secrets.txt".to_string(), "token=abc".to_string());
        template.important_files = vec!["src/main.tsx".to_string(), "secrets.txt".to_string()];
        template.redacted_files = vec!["secrets.txt".to_string()];

        let manager = FileManager::new(
            Arc::clone(&store),
            Arc::clone(&git),
            Arc::new(RwLock::new(template)),
            Arc::new(SystemClock),
        );
        (dir, store, git, manager)
    }

    #[test]
    fn test_generated_overrides_template() {
        let (_dir, _store, _git, manager) = fixture();
        manager
            .save_generated_files(
                vec![GeneratedFile::new("src/main.tsx", "custom()")],
                Some("override main"),
            )
            .unwrap();
        let files = manager.get_all_files();
        assert_eq!(files["src/main.tsx"], "custom()");
        assert_eq!(files["secrets.txt"], "token=abc");
    }

    #[test]
    fn test_relevant_files_apply_redactions() {
        let (_dir, _store, _git, manager) = fixture();
        let redacted = manager.get_all_relevant_files(true);
        assert_eq!(redacted["secrets.txt"], REDACTION_MARKER);
        let plain = manager.get_all_relevant_files(false);
        assert_eq!(plain["secrets.txt"], "token=abc");
    }

    #[test]
    fn test_save_computes_diff_against_template_base() {
        let (_dir, store, _git, manager) = fixture();
        manager
            .save_generated_files(
                vec![GeneratedFile::new("src/main.tsx", "bootstrap()\nrender()")],
                Some("extend main"),
            )
            .unwrap();
        let state = store.snapshot();
        let diff = &state.generated_files_map["src/main.tsx"].last_diff;
        assert!(diff.contains("+render()"));
        assert!(state.generated_files_map["src/main.tsx"].last_modified > 0);
    }

    #[test]
    fn test_idempotent_save_yields_empty_diff_and_no_commit() {
        let (_dir, store, git, manager) = fixture();
        let files = vec![GeneratedFile::new("src/App.tsx", "export {}")];
        manager
            .save_generated_files(files.clone(), Some("first"))
            .unwrap();
        let commits_before = git.log(10).unwrap().len();

        let saved = manager
            .save_generated_files(files, Some("second"))
            .unwrap();
        assert!(saved[0].last_diff.is_empty(), "second diff must be empty");
        assert_eq!(git.log(10).unwrap().len(), commits_before, "no no-op commit");
        assert!(store.snapshot().generated_files_map["src/App.tsx"]
            .last_diff
            .is_empty());
    }

    #[test]
    fn test_save_without_message_stages_only() {
        let (_dir, _store, git, manager) = fixture();
        manager
            .save_generated_files(vec![GeneratedFile::new("a.ts", "x")], None)
            .unwrap();
        assert!(git.head().unwrap().is_none());
        git.commit(&[], "flush staged").unwrap();
        assert_eq!(git.head_files().unwrap()["a.ts"], "x");
    }

    #[test]
    fn test_sync_from_head_preserves_purpose() {
        let (_dir, store, git, manager) = fixture();
        manager
            .save_generated_files(
                vec![GeneratedFile::new("src/App.tsx", "v1").with_purpose("app shell")],
                Some("first"),
            )
            .unwrap();
        // Move the tree forward behind the manager's back.
        git.commit(
            &[FileBlob::new("src/App.tsx", "v2"), FileBlob::new("b.ts", "y")],
            "external",
        )
        .unwrap();

        manager.sync_from_head().unwrap();
        let state = store.snapshot();
        assert_eq!(
            state.generated_files_map.keys().collect::<Vec<_>>(),
            git.head_files().unwrap().keys().collect::<Vec<_>>()
        );
        assert_eq!(state.generated_files_map["src/App.tsx"].purpose, "app shell");
        assert_eq!(state.generated_files_map["src/App.tsx"].contents, "v2");
    }

    #[test]
    fn test_delete_files_removes_from_store_and_head() {
        let (_dir, store, git, manager) = fixture();
        manager
            .save_generated_files(
                vec![GeneratedFile::new("a.ts", "x"), GeneratedFile::new("b.ts", "y")],
                Some("both"),
            )
            .unwrap();
        manager.delete_files(&["a.ts".to_string()]).unwrap();

        assert!(!store.snapshot().generated_files_map.contains_key("a.ts"));
        assert!(!git.head_files().unwrap().contains_key("a.ts"));
        assert!(git.head_files().unwrap().contains_key("b.ts"));
    }
}
