//! Project Setup Assistant
//!
//! Small model-backed helpers around project bring-up: setup commands for a
//! fresh sandbox, alternative install commands when a batch fails, and the
//! README generated at initialization.

use appforge_llm::{LlmRequestOptions, Message};
use tracing::debug;

use crate::services::operations::{extract_json, OperationContext};
use crate::services::sandbox::CommandOutcome;
use crate::utils::error::AppResult;

/// Commands that prepare a fresh sandbox clone of this project.
pub async fn generate_setup_commands(ctx: &OperationContext) -> AppResult<Vec<String>> {
    let frameworks = ctx
        .state
        .blueprint
        .as_ref()
        .map(|b| b.frameworks.join(", "))
        .unwrap_or_default();
    let prompt = format!(
        "Project `{}` uses template `{}` with frameworks: {frameworks}.\n\
         List the shell commands needed to prepare a fresh clone (installs, codegen). \
         Respond with a JSON array of command strings. Use bun, not npm.",
        ctx.state.project_name, ctx.template.name,
    );
    let response = ctx
        .provider
        .complete(
            vec![Message::user(prompt)],
            None,
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
            ctx.cancel.clone(),
        )
        .await?;
    let commands: Vec<String> = extract_json(&response.content)?;
    debug!(count = commands.len(), "setup commands generated");
    Ok(commands)
}

/// Alternative commands for a failed install batch.
pub async fn suggest_alternative_commands(
    ctx: &OperationContext,
    failed: &[CommandOutcome],
) -> AppResult<Vec<String>> {
    let failures: Vec<String> = failed
        .iter()
        .map(|f| format!("$ {}\nstderr: {}", f.command, f.stderr.trim()))
        .collect();
    let prompt = format!(
        "These install commands failed in the sandbox:\n{}\n\n\
         Suggest replacement commands that achieve the same installs (fix package names, \
         use bun). Respond with a JSON array of command strings; an empty array means give up.",
        failures.join("\n\n"),
    );
    let response = ctx
        .provider
        .complete(
            vec![Message::user(prompt)],
            None,
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
            ctx.cancel.clone(),
        )
        .await?;
    extract_json(&response.content)
}

/// README contents for the generated project.
pub async fn generate_readme(ctx: &OperationContext) -> AppResult<String> {
    let blueprint_summary = ctx
        .state
        .blueprint
        .as_ref()
        .map(|b| format!("{}: {}", b.title, b.description))
        .unwrap_or_else(|| ctx.state.query.clone());
    let prompt = format!(
        "Write a concise README.md for this project.\n\n{blueprint_summary}\n\n\
         Include: what the app does, how to run it locally (bun), and deployment notes."
    );
    let response = ctx
        .provider
        .complete(
            vec![Message::user(prompt)],
            None,
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.5),
                max_tokens: None,
            },
            ctx.cancel.clone(),
        )
        .await?;
    Ok(response.content)
}
