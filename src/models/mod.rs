//! Data Models
//!
//! Serde types for the persisted project document and its parts. The wire
//! and storage shape is camelCase to match the persisted-state contract.

pub mod blueprint;
pub mod conversation;
pub mod phase;
pub mod state;

pub use blueprint::{apply_blueprint_patch, Blueprint, BlueprintView, RoadmapItem};
pub use conversation::{ConversationMessage, MessageContent, ARCHIVE_PREFIX, INTERNAL_MEMO};
pub use phase::{FileConcept, GeneratedFile, PhaseConcept};
pub use state::{AgentMode, DevState, ProjectState, TemplateDetails};
