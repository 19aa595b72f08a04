//! Project State Document
//!
//! The single persisted JSON document per project. Every field name follows
//! the camelCase storage contract; loading passes through the migration
//! engine first, so legacy documents deserialize cleanly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::blueprint::Blueprint;
use crate::models::conversation::ConversationMessage;
use crate::models::phase::{GeneratedFile, PhaseConcept};

/// Phase-lifecycle states of the generation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevState {
    Idle,
    PhaseGenerating,
    PhaseImplementing,
    Reviewing,
    Finalizing,
}

impl Default for DevState {
    fn default() -> Self {
        DevState::Idle
    }
}

impl std::fmt::Display for DevState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DevState::Idle => "IDLE",
            DevState::PhaseGenerating => "PHASE_GENERATING",
            DevState::PhaseImplementing => "PHASE_IMPLEMENTING",
            DevState::Reviewing => "REVIEWING",
            DevState::Finalizing => "FINALIZING",
        };
        write!(f, "{s}")
    }
}

/// Post-phase fixing variant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Deterministic fixer only.
    Deterministic,
    /// Deterministic fixer followed by the LLM fast fixer.
    Smart,
}

impl Default for AgentMode {
    fn default() -> Self {
        AgentMode::Deterministic
    }
}

/// Cached template metadata (reconstructed on demand, not persisted beyond
/// the template name).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDetails {
    pub name: String,
    /// Full template file map: path → contents.
    #[serde(default)]
    pub all_files: BTreeMap<String, String>,
    /// Paths always included in model context.
    #[serde(default)]
    pub important_files: Vec<String>,
    /// Paths whose contents are replaced with a redaction marker when
    /// requested.
    #[serde(default)]
    pub redacted_files: Vec<String>,
}

/// The persisted per-project document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<Blueprint>,
    #[serde(default)]
    pub project_name: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub generated_phases: Vec<PhaseConcept>,
    #[serde(default)]
    pub generated_files_map: BTreeMap<String, GeneratedFile>,
    #[serde(default)]
    pub commands_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_package_json: Option<String>,
    #[serde(default)]
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_instance_id: Option<String>,
    #[serde(default)]
    pub should_be_generating: bool,
    #[serde(default)]
    pub mvp_generated: bool,
    #[serde(default)]
    pub reviewing_initiated: bool,
    #[serde(default)]
    pub agent_mode: AgentMode,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub phases_counter: i32,
    #[serde(default)]
    pub pending_user_inputs: Vec<String>,
    #[serde(default)]
    pub current_dev_state: DevState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_cycles: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseConcept>,
    #[serde(default)]
    pub conversation_messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub project_updates_accumulator: Vec<String>,
    /// Opaque inference routing context handed to every operation.
    #[serde(default)]
    pub inference_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deep_debug_transcript: Option<String>,
    /// Unix millis of project creation; also the author date of the GitHub
    /// template base commit.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub user_id: String,
}

impl ProjectState {
    /// The last phase in creation order that has not completed, if any.
    pub fn last_incomplete_phase(&self) -> Option<&PhaseConcept> {
        self.generated_phases.iter().rev().find(|p| !p.completed)
    }

    /// Mark the phase with the given id completed (and mirror into
    /// `current_phase` when it matches).
    pub fn mark_phase_completed(&mut self, phase_id: &str) {
        for phase in &mut self.generated_phases {
            if phase.id == phase_id {
                phase.completed = true;
            }
        }
        if let Some(current) = &mut self.current_phase {
            if current.id == phase_id {
                current.completed = true;
            }
        }
    }

    /// Upsert a phase by id, preserving creation order.
    pub fn upsert_phase(&mut self, phase: PhaseConcept) {
        if let Some(existing) = self.generated_phases.iter_mut().find(|p| p.id == phase.id) {
            *existing = phase;
        } else {
            self.generated_phases.push(phase);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_state_wire_format() {
        assert_eq!(
            serde_json::to_string(&DevState::PhaseImplementing).unwrap(),
            "\"PHASE_IMPLEMENTING\""
        );
        let parsed: DevState = serde_json::from_str("\"IDLE\"").unwrap();
        assert_eq!(parsed, DevState::Idle);
    }

    #[test]
    fn test_state_document_keys_are_camel_case() {
        let state = ProjectState {
            project_name: "todo-app".to_string(),
            phases_counter: 3,
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("projectName").is_some());
        assert!(value.get("phasesCounter").is_some());
        assert!(value.get("generatedFilesMap").is_some());
        assert!(value.get("currentDevState").is_some());
    }

    #[test]
    fn test_last_incomplete_phase_picks_latest() {
        let mut state = ProjectState::default();
        let mut setup = PhaseConcept::new("p0", "Setup", "scaffold");
        setup.completed = true;
        state.generated_phases.push(setup);
        state
            .generated_phases
            .push(PhaseConcept::new("p1", "API", "wire api"));
        state
            .generated_phases
            .push(PhaseConcept::new("p2", "UI", "build ui"));

        assert_eq!(state.last_incomplete_phase().unwrap().id, "p2");
    }

    #[test]
    fn test_mark_phase_completed_updates_current() {
        let mut state = ProjectState::default();
        let phase = PhaseConcept::new("p1", "API", "wire api");
        state.generated_phases.push(phase.clone());
        state.current_phase = Some(phase);

        state.mark_phase_completed("p1");
        assert!(state.generated_phases[0].completed);
        assert!(state.current_phase.as_ref().unwrap().completed);
    }

    #[test]
    fn test_empty_document_deserializes() {
        let state: ProjectState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.current_dev_state, DevState::Idle);
        assert_eq!(state.agent_mode, AgentMode::Deterministic);
    }
}
