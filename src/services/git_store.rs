//! Version Store
//!
//! Content-addressed version control over the generated-files union and the
//! source of truth for generated files. Blobs are addressed by sha256 of
//! their contents; a commit records a parent, a message, a timestamp, and a
//! tree (path → blob oid). `HEAD` is a named ref in the database.
//!
//! The store never imports the file manager: when files change
//! (commit/reset), a callback registered at construction time fires so the
//! file manager can rebuild its map from `HEAD`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use appforge_core::context::Clock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::{debug, info};

use crate::storage::database::{Database, StoredCommit};
use crate::utils::error::{AppError, AppResult};

const HEAD_REF: &str = "HEAD";

/// A file snapshot handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBlob {
    pub path: String,
    pub contents: String,
}

impl FileBlob {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}

/// Commit metadata returned by `log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub oid: String,
    pub message: String,
    /// Unix millis.
    pub timestamp: i64,
    pub author: String,
}

/// Full commit view returned by `show`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitDetails {
    #[serde(flatten)]
    pub info: CommitInfo,
    pub files: Vec<String>,
    /// Per-file unified diff vs the parent commit, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diffs: Option<BTreeMap<String, String>>,
}

/// A flat object export suitable for pushing to an external remote.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedObject {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Callback invoked after `HEAD` moves.
pub type FilesChangedCallback = Arc<dyn Fn() + Send + Sync>;

/// Content-addressed version store.
pub struct GitStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    author: String,
    /// Pending tree edits: path → Some(contents) to write, None to delete.
    staged: Mutex<BTreeMap<String, Option<String>>>,
    on_files_changed: Mutex<Option<FilesChangedCallback>>,
}

impl GitStore {
    pub fn new(db: Arc<Database>, clock: Arc<dyn Clock>, author: impl Into<String>) -> Self {
        Self {
            db,
            clock,
            author: author.into(),
            staged: Mutex::new(BTreeMap::new()),
            on_files_changed: Mutex::new(None),
        }
    }

    /// Register the one-way on-change callback. Registered once at
    /// composition time; re-registration replaces the previous callback.
    pub fn set_on_files_changed(&self, callback: FilesChangedCallback) {
        *self
            .on_files_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Idempotent initialization: the store is usable with no commits; this
    /// only verifies the backing tables respond.
    pub fn init(&self) -> AppResult<()> {
        let _ = self.db.get_ref(HEAD_REF)?;
        Ok(())
    }

    /// Current `HEAD` oid, if any commit exists.
    pub fn head(&self) -> AppResult<Option<String>> {
        self.db.get_ref(HEAD_REF)
    }

    /// Stage file writes without committing.
    pub fn stage(&self, files: &[FileBlob]) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        for file in files {
            staged.insert(file.path.clone(), Some(file.contents.clone()));
        }
    }

    /// Stage file removals without committing.
    pub fn stage_removals(&self, paths: &[String]) {
        let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
        for path in paths {
            staged.insert(path.clone(), None);
        }
    }

    /// Commit `files` (merged over anything already staged) with `message`.
    /// An empty slice commits the currently staged set.
    ///
    /// Returns the new commit oid, or `None` when the resulting tree is
    /// identical to `HEAD` (no empty commits).
    pub fn commit(&self, files: &[FileBlob], message: &str) -> AppResult<Option<String>> {
        self.stage(files);

        let head_oid = self.head()?;
        let mut tree = match &head_oid {
            Some(oid) => self.tree_of(oid)?,
            None => BTreeMap::new(),
        };

        let edits = {
            let mut staged = self.staged.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *staged)
        };
        for (path, contents) in edits {
            match contents {
                Some(contents) => {
                    let blob_oid = sha256_hex(contents.as_bytes());
                    self.db.put_blob(&blob_oid, contents.as_bytes())?;
                    tree.insert(path, blob_oid);
                }
                None => {
                    tree.remove(&path);
                }
            }
        }

        if let Some(head) = &head_oid {
            if self.tree_of(head)? == tree {
                debug!("commit skipped: tree unchanged");
                return Ok(None);
            }
        } else if tree.is_empty() {
            return Ok(None);
        }

        let timestamp = self.clock.now_millis();
        let tree_json = serde_json::to_string(&tree)?;
        let oid = commit_oid(head_oid.as_deref(), message, timestamp, &tree_json);
        self.db.put_commit(&StoredCommit {
            oid: oid.clone(),
            parent: head_oid,
            message: message.to_string(),
            author: self.author.clone(),
            timestamp,
            tree_json,
        })?;
        self.db.set_ref(HEAD_REF, &oid)?;
        info!(oid = %oid, message, "created commit");

        self.fire_files_changed();
        Ok(Some(oid))
    }

    /// Commit history from `HEAD` backwards, newest first.
    pub fn log(&self, limit: usize) -> AppResult<Vec<CommitInfo>> {
        let mut result = Vec::new();
        let mut cursor = self.head()?;
        while let Some(oid) = cursor {
            if result.len() >= limit {
                break;
            }
            let commit = self
                .db
                .get_commit(&oid)?
                .ok_or_else(|| AppError::git(format!("dangling commit {oid}")))?;
            result.push(CommitInfo {
                oid: commit.oid,
                message: commit.message,
                timestamp: commit.timestamp,
                author: commit.author,
            });
            cursor = commit.parent;
        }
        Ok(result)
    }

    /// Commit metadata, file list, and (optionally) per-file unified diffs
    /// against the parent commit.
    pub fn show(&self, oid: &str, include_diff: bool) -> AppResult<CommitDetails> {
        let commit = self
            .db
            .get_commit(oid)?
            .ok_or_else(|| AppError::not_found(format!("commit {oid}")))?;
        let tree: BTreeMap<String, String> = serde_json::from_str(&commit.tree_json)?;
        let parent_tree = match &commit.parent {
            Some(parent) => self.tree_of(parent)?,
            None => BTreeMap::new(),
        };

        let diffs = if include_diff {
            let mut diffs = BTreeMap::new();
            for (path, blob_oid) in &tree {
                let new = self.blob_text(blob_oid)?;
                let old = match parent_tree.get(path) {
                    Some(parent_blob) => self.blob_text(parent_blob)?,
                    None => String::new(),
                };
                let diff = unified_diff(&old, &new, path);
                if !diff.is_empty() {
                    diffs.insert(path.clone(), diff);
                }
            }
            for path in parent_tree.keys() {
                if !tree.contains_key(path) {
                    let old = self.blob_text(&parent_tree[path])?;
                    diffs.insert(path.clone(), unified_diff(&old, "", path));
                }
            }
            Some(diffs)
        } else {
            None
        };

        Ok(CommitDetails {
            info: CommitInfo {
                oid: commit.oid,
                message: commit.message,
                timestamp: commit.timestamp,
                author: commit.author,
            },
            files: tree.keys().cloned().collect(),
            diffs,
        })
    }

    /// Move `HEAD` to `oid`. With `hard`, staged edits are discarded and the
    /// on-change callback fires so the working view is rewritten. This is
    /// destructive; the calling tool surfaces an explicit warning flag.
    pub fn reset(&self, oid: &str, hard: bool) -> AppResult<()> {
        if self.db.get_commit(oid)?.is_none() {
            return Err(AppError::not_found(format!("commit {oid}")));
        }
        self.db.set_ref(HEAD_REF, oid)?;
        if hard {
            self.staged
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            self.fire_files_changed();
        }
        Ok(())
    }

    /// All files at `HEAD`: path → contents.
    pub fn head_files(&self) -> AppResult<BTreeMap<String, String>> {
        match self.head()? {
            Some(head) => self.files_at(&head),
            None => Ok(BTreeMap::new()),
        }
    }

    /// All files at a given commit: path → contents.
    pub fn files_at(&self, oid: &str) -> AppResult<BTreeMap<String, String>> {
        let tree = self.tree_of(oid)?;
        let mut files = BTreeMap::new();
        for (path, blob_oid) in tree {
            files.insert(path.clone(), self.blob_text(&blob_oid)?);
        }
        Ok(files)
    }

    /// Flat export of the `HEAD` tree for pushing to an external remote.
    pub fn export_objects(&self) -> AppResult<Vec<ExportedObject>> {
        Ok(self
            .head_files()?
            .into_iter()
            .map(|(path, contents)| ExportedObject {
                path,
                bytes: contents.into_bytes(),
            })
            .collect())
    }

    fn tree_of(&self, oid: &str) -> AppResult<BTreeMap<String, String>> {
        let commit = self
            .db
            .get_commit(oid)?
            .ok_or_else(|| AppError::git(format!("dangling commit {oid}")))?;
        Ok(serde_json::from_str(&commit.tree_json)?)
    }

    fn blob_text(&self, oid: &str) -> AppResult<String> {
        let bytes = self
            .db
            .get_blob(oid)?
            .ok_or_else(|| AppError::git(format!("dangling blob {oid}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn fire_files_changed(&self) {
        let callback = self
            .on_files_changed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Unified diff between two text versions of `path`.
pub fn unified_diff(old: &str, new: &str, path: &str) -> String {
    if old == new {
        return String::new();
    }
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn commit_oid(parent: Option<&str>, message: &str, timestamp: i64, tree_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(message.as_bytes());
    hasher.update([0]);
    hasher.update(timestamp.to_be_bytes());
    hasher.update([0]);
    hasher.update(tree_json.as_bytes());
    format!("{:x}", hasher.finalize())
}
