//! File Regeneration
//!
//! Rewrites a single file to resolve a set of issues, with up to three
//! internal passes when the model returns something unusable.

use appforge_llm::{LlmRequestOptions, Message};
use tracing::{debug, warn};

use crate::models::phase::GeneratedFile;
use crate::services::operations::{extract_code_block, OperationContext};
use crate::services::sandbox::AnalysisIssue;
use crate::utils::error::{AppError, AppResult};

/// Internal retry budget per regeneration request.
const MAX_PASSES: u32 = 3;

const SYSTEM_PROMPT: &str = "You rewrite one source file to resolve the listed issues. \
Respond with exactly one fenced code block containing the complete new file contents. \
Do not abbreviate or omit unchanged sections.";

/// Regenerate `file` so the listed issues are resolved. `retry_index` counts
/// caller-level retries and is fed back into the prompt so later attempts
/// diverge from the earlier ones.
pub async fn regenerate_file(
    ctx: &OperationContext,
    file: &GeneratedFile,
    issues: &[AnalysisIssue],
    retry_index: u32,
) -> AppResult<GeneratedFile> {
    let issue_lines: Vec<String> = issues
        .iter()
        .map(|i| {
            format!(
                "- [{}] {}{}",
                i.code,
                i.message,
                i.line.map(|l| format!(" (line {l})")).unwrap_or_default()
            )
        })
        .collect();
    let mut prompt = format!(
        "File `{}` (purpose: {}) has these issues:\n{}\n\nCurrent contents:\n```\n{}\n```\n",
        file.path,
        file.purpose,
        issue_lines.join("\n"),
        file.contents,
    );
    if retry_index > 0 {
        prompt.push_str(&format!(
            "\nEarlier attempt {retry_index} did not resolve the issues; take a different approach.\n"
        ));
    }

    for pass in 0..MAX_PASSES {
        let response = ctx
            .provider
            .complete(
                vec![Message::user(prompt.clone())],
                Some(SYSTEM_PROMPT.to_string()),
                Vec::new(),
                LlmRequestOptions {
                    temperature: Some(0.0),
                    max_tokens: None,
                },
                ctx.cancel.clone(),
            )
            .await?;

        match extract_code_block(&response.content) {
            Some(contents) if !contents.trim().is_empty() => {
                debug!(path = %file.path, pass, "file regenerated");
                let mut regenerated = file.clone();
                regenerated.contents = contents.trim_end_matches('\n').to_string();
                return Ok(regenerated);
            }
            _ => {
                warn!(path = %file.path, pass, "regeneration pass produced no code block");
            }
        }
    }

    Err(AppError::validation(format!(
        "regeneration of {} produced no usable contents in {MAX_PASSES} passes",
        file.path
    )))
}
