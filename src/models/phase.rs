//! Phase and File Models
//!
//! A phase is one contiguous unit of implementation work with a fixed file
//! manifest. Generated files are keyed by path; template files live
//! separately and are overridden by generated files of the same path.

use serde::{Deserialize, Serialize};

/// Marker value in `FileConcept.changes` requesting deletion of the file.
pub const CHANGES_DELETE: &str = "delete";

/// One contiguous unit of implementation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConcept {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<FileConcept>,
    #[serde(default)]
    pub last_phase: bool,
    #[serde(default)]
    pub completed: bool,
}

impl PhaseConcept {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
            files: Vec::new(),
            last_phase: false,
            completed: false,
        }
    }

    pub fn with_files(mut self, files: Vec<FileConcept>) -> Self {
        self.files = files;
        self
    }

    pub fn as_last_phase(mut self) -> Self {
        self.last_phase = true;
        self
    }
}

/// A file planned for a phase: where it goes, why it exists, and what should
/// happen to it (`changes` is `"delete"`, a change description, or absent for
/// a fresh file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileConcept {
    pub path: String,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<String>,
}

impl FileConcept {
    pub fn new(path: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            purpose: purpose.into(),
            changes: None,
        }
    }

    /// Whether this concept requests deletion of the file.
    pub fn is_delete(&self) -> bool {
        self.changes.as_deref() == Some(CHANGES_DELETE)
    }
}

/// A generated source file with its latest diff against the previous
/// contents (fallback base: template contents or empty).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub last_diff: String,
    /// Unix millis of the last write.
    #[serde(default)]
    pub last_modified: i64,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            purpose: String::new(),
            last_diff: String::new(),
            last_modified: 0,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serialization_is_camel_case() {
        let phase = PhaseConcept::new("p1", "API", "Wire the API").as_last_phase();
        let value = serde_json::to_value(&phase).unwrap();
        assert_eq!(value["lastPhase"], true);
        assert_eq!(value["completed"], false);
    }

    #[test]
    fn test_file_concept_delete_marker() {
        let mut concept = FileConcept::new("src/old.ts", "legacy helper");
        assert!(!concept.is_delete());
        concept.changes = Some(CHANGES_DELETE.to_string());
        assert!(concept.is_delete());
        concept.changes = Some("tighten types".to_string());
        assert!(!concept.is_delete());
    }

    #[test]
    fn test_file_concept_omits_absent_changes() {
        let json = serde_json::to_string(&FileConcept::new("a.ts", "entry")).unwrap();
        assert!(!json.contains("changes"));
    }

    #[test]
    fn test_generated_file_defaults() {
        let parsed: GeneratedFile =
            serde_json::from_str(r#"{"path":"src/App.tsx","contents":"export {}"}"#).unwrap();
        assert_eq!(parsed.purpose, "");
        assert_eq!(parsed.last_modified, 0);
    }
}
