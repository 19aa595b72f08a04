//! Blueprint Planning
//!
//! Produces the structured project plan from the user's query, streaming raw
//! chunks to the caller while the model works. The blueprint carries the
//! initial phase, so the first implementation pass never waits on a separate
//! planning call.

use appforge_llm::{LlmRequestOptions, Message};
use serde::Deserialize;
use tracing::info;

use crate::models::blueprint::{Blueprint, BlueprintView, RoadmapItem};
use crate::models::phase::{FileConcept, PhaseConcept};
use crate::services::operations::{extract_json, stream_with_chunks, OperationContext};
use crate::utils::error::AppResult;

/// Inputs for blueprint planning.
#[derive(Debug, Clone)]
pub struct BlueprintRequest {
    pub query: String,
    pub language: String,
    pub frameworks: Vec<String>,
    pub project_name: String,
}

const SYSTEM_PROMPT: &str = "You are a senior product engineer planning a web application. \
Respond with a single JSON object: {\"title\", \"description\", \"frameworks\", \"views\": \
[{\"name\", \"description\"}], \"userFlow\", \"architecture\", \"pitfalls\", \
\"implementationRoadmap\": [{\"phase\", \"description\"}], \"colorPalette\", \
\"initialPhase\": {\"name\", \"description\", \"files\": [{\"path\", \"purpose\"}]}}. \
The initial phase must be a small, deployable slice of the app.";

/// Wire shape of the model's plan; looser than [`Blueprint`] so partial
/// answers still land.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlueprintDraft {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    frameworks: Vec<String>,
    #[serde(default)]
    views: Vec<BlueprintView>,
    #[serde(default)]
    user_flow: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    pitfalls: Vec<String>,
    #[serde(default)]
    implementation_roadmap: Vec<RoadmapItem>,
    #[serde(default)]
    color_palette: Vec<String>,
    initial_phase: InitialPhaseDraft,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitialPhaseDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<FileConcept>,
}

/// Plan the blueprint, forwarding model chunks to `on_chunk` as they stream.
pub async fn plan_blueprint(
    ctx: &OperationContext,
    request: BlueprintRequest,
    mut on_chunk: impl FnMut(String),
) -> AppResult<Blueprint> {
    let template_summary = ctx
        .template
        .important_files
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n");
    let user_prompt = format!(
        "Product request: {query}\n\nTarget language: {language}\nPreferred frameworks: \
         {frameworks}\nTemplate `{template}` important files:\n{template_summary}",
        query = request.query,
        language = request.language,
        frameworks = request.frameworks.join(", "),
        template = ctx.template.name,
    );

    let response = stream_with_chunks(
        &ctx.provider,
        vec![Message::user(user_prompt)],
        Some(SYSTEM_PROMPT.to_string()),
        Vec::new(),
        LlmRequestOptions {
            temperature: Some(0.7),
            max_tokens: None,
        },
        ctx.cancel.clone(),
        |chunk| on_chunk(chunk),
    )
    .await?;

    let draft: BlueprintDraft = extract_json(&response.content)?;
    let initial_phase = PhaseConcept {
        id: format!("phase-{}", ctx.runtime.short_id()),
        name: draft.initial_phase.name,
        description: draft.initial_phase.description,
        files: draft.initial_phase.files,
        last_phase: false,
        completed: false,
    };
    info!(title = %draft.title, files = initial_phase.files.len(), "blueprint planned");

    Ok(Blueprint {
        title: draft.title,
        project_name: request.project_name,
        description: draft.description,
        frameworks: if draft.frameworks.is_empty() {
            request.frameworks
        } else {
            draft.frameworks
        },
        views: draft.views,
        user_flow: draft.user_flow,
        architecture: draft.architecture,
        pitfalls: draft.pitfalls,
        implementation_roadmap: draft.implementation_roadmap,
        initial_phase,
        color_palette: draft.color_palette,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draft_parses_minimal_plan() {
        let raw = r#"{
            "title": "Todo",
            "initialPhase": {"name": "Setup", "files": [{"path": "src/App.tsx", "purpose": "shell"}]}
        }"#;
        let draft: BlueprintDraft = extract_json(raw).unwrap();
        assert_eq!(draft.title, "Todo");
        assert_eq!(draft.initial_phase.files.len(), 1);
        assert!(draft.frameworks.is_empty());
    }

    #[test]
    fn test_draft_rejects_missing_initial_phase() {
        let raw = r#"{"title": "Todo"}"#;
        let result: AppResult<BlueprintDraft> = extract_json(raw);
        assert!(result.is_err());
    }
}
