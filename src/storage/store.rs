//! Project State Store
//!
//! Single-writer, many-reader in-process holder of the project document with
//! write-through persistence: every mutation is serialized and written to
//! the database before the call returns. Loading passes the raw document
//! through the migration engine; a migrated document is persisted back
//! immediately so the upgrade happens exactly once.
//!
//! A one-way callback registered at composition time fires after every
//! persisted write; the orchestrator uses it to broadcast the full-state
//! reconciliation event to clients.

use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tracing::info;

use crate::migration;
use crate::models::state::ProjectState;
use crate::storage::database::Database;
use crate::utils::error::{AppError, AppResult};

/// Callback invoked with the new document after every persisted write.
pub type StateChangedCallback = Arc<dyn Fn(&ProjectState) + Send + Sync>;

/// Write-through state store, shared across the orchestrator via `Arc`.
pub struct Store {
    db: Arc<Database>,
    project_id: String,
    state: RwLock<ProjectState>,
    on_change: Mutex<Option<StateChangedCallback>>,
}

impl Store {
    /// Load the project document, migrating it forward if needed, or persist
    /// `initial` when no document exists yet.
    pub fn load_or_init(
        db: Arc<Database>,
        project_id: impl Into<String>,
        initial: ProjectState,
    ) -> AppResult<Self> {
        let project_id = project_id.into();
        let state = match db.load_project_state(&project_id)? {
            Some(raw) => {
                let mut doc: Value = serde_json::from_str(&raw)?;
                if let Some(migrated) = migration::migrate(&doc) {
                    info!(project_id = %project_id, "migrated persisted state to current schema");
                    db.save_project_state(&project_id, &serde_json::to_string(&migrated)?)?;
                    doc = migrated;
                }
                serde_json::from_value(doc)?
            }
            None => {
                db.save_project_state(&project_id, &serde_json::to_string(&initial)?)?;
                initial
            }
        };
        Ok(Self {
            db,
            project_id,
            state: RwLock::new(state),
            on_change: Mutex::new(None),
        })
    }

    /// Register the one-way on-change callback. Registered once at
    /// composition time; re-registration replaces the previous callback.
    pub fn set_on_change(&self, callback: StateChangedCallback) {
        *self.on_change.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Immutable snapshot of the current state.
    pub fn snapshot(&self) -> ProjectState {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the whole document and persist.
    pub fn replace(&self, new: ProjectState) -> AppResult<()> {
        let serialized = serde_json::to_string(&new)?;
        let snapshot = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            *guard = new;
            guard.clone()
        };
        self.db.save_project_state(&self.project_id, &serialized)?;
        self.fire_on_change(&snapshot);
        Ok(())
    }

    /// Apply `f` under the write lock and persist durably before returning.
    ///
    /// The closure's return value is handed back so callers can read derived
    /// data from the same critical section. The on-change callback fires
    /// after the write lands, outside the lock.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut ProjectState) -> R) -> AppResult<R> {
        let (result, serialized, snapshot) = {
            let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
            let result = f(&mut guard);
            (result, serde_json::to_string(&*guard)?, guard.clone())
        };
        self.db.save_project_state(&self.project_id, &serialized)?;
        self.fire_on_change(&snapshot);
        Ok(result)
    }

    fn fire_on_change(&self, state: &ProjectState) {
        let callback = self
            .on_change
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Reload the persisted document (used by tests to assert durability).
    pub fn reload_persisted(&self) -> AppResult<ProjectState> {
        let raw = self
            .db
            .load_project_state(&self.project_id)?
            .ok_or_else(|| AppError::not_found(format!("state for {}", self.project_id)))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("test.db")).unwrap());
        let store = Store::load_or_init(db, "proj-1", ProjectState::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_mutation_is_durable_before_return() {
        let (_dir, store) = test_store();
        store
            .mutate(|s| {
                s.project_name = "todo-app".to_string();
                s.phases_counter = 3;
            })
            .unwrap();

        let persisted = store.reload_persisted().unwrap();
        assert_eq!(persisted.project_name, "todo-app");
        assert_eq!(persisted.phases_counter, 3);
    }

    #[test]
    fn test_mutate_returns_closure_value() {
        let (_dir, store) = test_store();
        let counter = store
            .mutate(|s| {
                s.phases_counter += 1;
                s.phases_counter
            })
            .unwrap();
        assert_eq!(counter, 1);
    }

    #[test]
    fn test_reload_after_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Arc::new(Database::open(&path).unwrap());
            let store = Store::load_or_init(db, "proj-1", ProjectState::default()).unwrap();
            store
                .mutate(|s| s.query = "build a todo app".to_string())
                .unwrap();
        }
        let db = Arc::new(Database::open(&path).unwrap());
        let store = Store::load_or_init(db, "proj-1", ProjectState::default()).unwrap();
        assert_eq!(store.snapshot().query, "build a todo app");
    }

    #[test]
    fn test_on_change_fires_after_every_write() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (_dir, store) = test_store();
        let seen = Arc::new(AtomicUsize::new(0));
        let last_name = Arc::new(std::sync::Mutex::new(String::new()));
        {
            let seen = Arc::clone(&seen);
            let last_name = Arc::clone(&last_name);
            store.set_on_change(Arc::new(move |state| {
                seen.fetch_add(1, Ordering::SeqCst);
                *last_name.lock().unwrap() = state.project_name.clone();
            }));
        }

        store
            .mutate(|s| s.project_name = "todo-app".to_string())
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(*last_name.lock().unwrap(), "todo-app");

        store
            .replace(ProjectState {
                project_name: "renamed".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(*last_name.lock().unwrap(), "renamed");
    }

    #[test]
    fn test_legacy_document_is_migrated_on_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let db = Arc::new(Database::open(&path).unwrap());
        // Legacy snake_case file keys from an old schema.
        db.save_project_state(
            "proj-legacy",
            r#"{"projectName":"legacy","generatedFilesMap":{"src/a.ts":{"file_path":"src/a.ts","file_contents":"x","file_purpose":"entry"}}}"#,
        )
        .unwrap();

        let store = Store::load_or_init(db, "proj-legacy", ProjectState::default()).unwrap();
        let state = store.snapshot();
        let file = state.generated_files_map.get("src/a.ts").unwrap();
        assert_eq!(file.contents, "x");
        assert_eq!(file.purpose, "entry");
    }
}
