//! Phase Planning
//!
//! Decides the next contiguous unit of implementation work from the
//! blueprint roadmap, the current file tree, outstanding issues, and queued
//! user suggestions. Returns `None` when the project needs no further phase.

use appforge_llm::{LlmRequestOptions, Message};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::models::phase::{FileConcept, PhaseConcept};
use crate::services::operations::{extract_json, OperationContext};
use crate::services::sandbox::AnalysisIssue;
use crate::utils::error::AppResult;

/// User-supplied planning inputs: queued suggestions and pasted images.
#[derive(Debug, Clone, Default)]
pub struct UserContext {
    pub suggestions: Vec<String>,
    pub images: Vec<Value>,
}

/// A planned phase plus its side requirements.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    pub phase: PhaseConcept,
    pub install_commands: Vec<String>,
    pub files_to_delete: Vec<String>,
}

const SYSTEM_PROMPT: &str = "You plan the next implementation phase of a web application. \
Respond with a single JSON object: {\"phase\": {\"name\", \"description\", \"lastPhase\", \
\"files\": [{\"path\", \"purpose\", \"changes\"}]} | null, \"installCommands\": [string], \
\"filesToDelete\": [string]}. Use \"phase\": null when the project is complete. \
Set \"changes\" to \"delete\" for files to remove, or to a short change summary for \
existing files.";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanDraft {
    phase: Option<PhaseDraft>,
    #[serde(default)]
    install_commands: Vec<String>,
    #[serde(default)]
    files_to_delete: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhaseDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    last_phase: bool,
    #[serde(default)]
    files: Vec<FileConcept>,
}

/// Plan the next phase. `is_user_suggested` biases the prompt toward the
/// queued suggestions instead of the roadmap.
pub async fn plan_next_phase(
    ctx: &OperationContext,
    issues: &[AnalysisIssue],
    user_context: &UserContext,
    is_user_suggested: bool,
) -> AppResult<Option<PhasePlan>> {
    let completed: Vec<String> = ctx
        .state
        .generated_phases
        .iter()
        .map(|p| {
            format!(
                "- {} ({})",
                p.name,
                if p.completed { "done" } else { "incomplete" }
            )
        })
        .collect();
    let roadmap: Vec<String> = ctx
        .state
        .blueprint
        .as_ref()
        .map(|b| {
            b.implementation_roadmap
                .iter()
                .map(|r| format!("- {}: {}", r.phase, r.description))
                .collect()
        })
        .unwrap_or_default();

    let mut prompt = format!(
        "Phases so far:\n{}\n\nRoadmap:\n{}\n\nFiles:\n{}\n",
        completed.join("\n"),
        roadmap.join("\n"),
        ctx.file_inventory(),
    );
    if !issues.is_empty() {
        let issue_lines: Vec<String> = issues
            .iter()
            .map(|i| format!("- [{}] {}", i.code, i.message))
            .collect();
        prompt.push_str(&format!("\nOutstanding issues:\n{}\n", issue_lines.join("\n")));
    }
    if !user_context.suggestions.is_empty() {
        prompt.push_str(&format!(
            "\nUser requests{}:\n{}\n",
            if is_user_suggested {
                " (plan the next phase around these)"
            } else {
                ""
            },
            user_context.suggestions.join("\n"),
        ));
    }

    let response = ctx
        .provider
        .complete(
            vec![Message::user(prompt)],
            Some(SYSTEM_PROMPT.to_string()),
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.4),
                max_tokens: None,
            },
            ctx.cancel.clone(),
        )
        .await?;

    let draft: PlanDraft = extract_json(&response.content)?;
    let Some(phase) = draft.phase else {
        debug!("planner returned no next phase");
        return Ok(None);
    };

    let concept = PhaseConcept {
        id: format!("phase-{}", ctx.runtime.short_id()),
        name: phase.name,
        description: phase.description,
        files: phase.files,
        last_phase: phase.last_phase,
        completed: false,
    };
    info!(name = %concept.name, last_phase = concept.last_phase, "next phase planned");

    Ok(Some(PhasePlan {
        phase: concept,
        install_commands: draft.install_commands,
        files_to_delete: draft.files_to_delete,
    }))
}
