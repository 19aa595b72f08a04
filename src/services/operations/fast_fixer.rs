//! Fast Code Fixer
//!
//! LLM-backed patching in two shapes: a batch fixer that patches whichever
//! files the listed issues touch, and the realtime single-file fixer run
//! concurrently during phase implementation. The realtime fixer never loses
//! a file: on any failure it returns the input unchanged.

use std::collections::BTreeMap;
use std::sync::Arc;

use appforge_llm::{InferenceProvider, LlmRequestOptions, Message};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::phase::GeneratedFile;
use crate::services::operations::{extract_code_block, extract_json, OperationContext};
use crate::services::sandbox::AnalysisIssue;
use crate::utils::error::AppResult;

const BATCH_SYSTEM_PROMPT: &str = "You fix code issues across a project. Respond with a JSON \
array of patched files: [{\"path\", \"contents\"}]. Only include files you changed, always \
with complete contents.";

const SINGLE_SYSTEM_PROMPT: &str = "You review one freshly generated source file and fix any \
obvious defects (syntax errors, missing imports, unbalanced braces). If the file is fine, \
return it unchanged. Respond with exactly one fenced code block containing the complete file.";

#[derive(Debug, Deserialize)]
struct PatchedFile {
    path: String,
    contents: String,
}

/// Patch the files the issues point at. Returns only changed files.
pub async fn fast_code_fixer(
    ctx: &OperationContext,
    query: &str,
    issues: &[AnalysisIssue],
    all_files: &BTreeMap<String, String>,
) -> AppResult<Vec<GeneratedFile>> {
    if issues.is_empty() {
        return Ok(Vec::new());
    }

    // Only ship files the issues actually reference, with a small fallback
    // context when an issue has no path.
    let mut relevant: BTreeMap<&String, &String> = BTreeMap::new();
    for issue in issues {
        if let Some(path) = &issue.file_path {
            if let Some((k, v)) = all_files.get_key_value(path) {
                relevant.insert(k, v);
            }
        }
    }
    if relevant.is_empty() {
        relevant = all_files.iter().take(12).collect();
    }

    let issue_lines: Vec<String> = issues
        .iter()
        .map(|i| {
            format!(
                "- [{}] {} {}",
                i.code,
                i.file_path.as_deref().unwrap_or("<project>"),
                i.message
            )
        })
        .collect();
    let file_blocks: Vec<String> = relevant
        .iter()
        .map(|(path, contents)| format!("### {path}\n```\n{contents}\n```"))
        .collect();
    let prompt = format!(
        "Project goal: {query}\n\nIssues:\n{}\n\nFiles:\n{}\n",
        issue_lines.join("\n"),
        file_blocks.join("\n\n"),
    );

    let response = ctx
        .provider
        .complete(
            vec![Message::user(prompt)],
            Some(BATCH_SYSTEM_PROMPT.to_string()),
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
            ctx.cancel.clone(),
        )
        .await?;

    let patched: Vec<PatchedFile> = extract_json(&response.content)?;
    debug!(count = patched.len(), "fast fixer produced patches");
    Ok(patched
        .into_iter()
        .filter(|p| all_files.contains_key(&p.path))
        .map(|p| GeneratedFile::new(p.path, p.contents))
        .collect())
}

/// Realtime per-file fixer. Failure modes (cancellation, inference errors,
/// unusable output) all resolve to the unmodified input file.
pub async fn fix_single_file(
    provider: Arc<dyn InferenceProvider>,
    file: GeneratedFile,
    cancel: CancellationToken,
) -> GeneratedFile {
    let prompt = format!(
        "File `{}` (purpose: {}):\n```\n{}\n```",
        file.path, file.purpose, file.contents
    );
    let result = provider
        .complete(
            vec![Message::user(prompt)],
            Some(SINGLE_SYSTEM_PROMPT.to_string()),
            Vec::new(),
            LlmRequestOptions {
                temperature: Some(0.0),
                max_tokens: None,
            },
            cancel,
        )
        .await;

    match result {
        Ok(response) => match extract_code_block(&response.content) {
            Some(contents) if !contents.trim().is_empty() => {
                let mut fixed = file.clone();
                fixed.contents = contents.trim_end_matches('\n').to_string();
                fixed
            }
            _ => {
                warn!(path = %file.path, "realtime fixer returned no code block; keeping original");
                file
            }
        },
        Err(e) => {
            warn!(path = %file.path, error = %e, "realtime fixer failed; keeping original");
            file
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patched_file_parse() {
        let raw = r#"[{"path": "src/a.ts", "contents": "fixed"}]"#;
        let patched: Vec<PatchedFile> = extract_json(raw).unwrap();
        assert_eq!(patched[0].path, "src/a.ts");
        assert_eq!(patched[0].contents, "fixed");
    }
}
