//! Command Pipeline
//!
//! Deterministic handling of shell commands destined for the sandbox:
//! normalization (bullet stripping, npm → bun rewrites), a shape predicate,
//! dedup, batching, install-failure retries with model-suggested
//! alternatives, and the bootstrap script regenerated from the validated
//! history.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::services::operations::{setup, OperationContext};
use crate::services::sandbox::{CommandOutcome, SandboxApi};
use crate::utils::error::AppResult;

/// Commands per execution batch.
pub const BATCH_SIZE: usize = 5;
/// Install-failure retries per batch.
const MAX_BATCH_RETRIES: u32 = 3;

/// Path of the regenerated bootstrap script.
pub const BOOTSTRAP_PATH: &str = ".bootstrap.js";

/// First tokens we accept as runnable commands.
const KNOWN_TOOLS: &[&str] = &[
    "bun", "bunx", "npm", "npx", "node", "git", "wrangler", "mkdir", "touch", "cp", "mv", "rm",
    "ls", "cat", "echo", "curl", "sed", "tsc", "vite",
];

/// Shape predicate: a single short line starting with a known tool.
pub fn looks_like_command(cmd: &str) -> bool {
    let cmd = cmd.trim();
    if cmd.is_empty() || cmd.len() > 300 || cmd.contains('\n') {
        return false;
    }
    let first = cmd.split_whitespace().next().unwrap_or_default();
    KNOWN_TOOLS.contains(&first)
}

/// Strip list decoration the model tends to emit around commands.
fn strip_decoration(cmd: &str) -> &str {
    let mut cmd = cmd.trim();
    for prefix in ["- ", "* ", "$ ", "> "] {
        if let Some(rest) = cmd.strip_prefix(prefix) {
            cmd = rest.trim();
        }
    }
    // Numbered bullets: "1. bun install"
    if let Some(dot) = cmd.find(". ") {
        if cmd[..dot].chars().all(|c| c.is_ascii_digit()) {
            cmd = cmd[dot + 2..].trim();
        }
    }
    cmd.trim_matches('`').trim()
}

/// Rewrite npm invocations to their bun equivalents.
fn rewrite_to_bun(cmd: &str) -> String {
    let mut tokens: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return String::new();
    }
    match tokens[0].as_str() {
        "npm" => {
            tokens[0] = "bun".to_string();
            if tokens.len() > 1 && tokens[1] == "i" {
                tokens[1] = "install".to_string();
            }
        }
        "npx" => tokens[0] = "bunx".to_string(),
        _ => {}
    }
    tokens.join(" ")
}

/// Normalize raw model output into runnable commands: strip decoration,
/// rewrite npm → bun, dedupe preserving order, filter by shape.
pub fn normalize_commands(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|c| rewrite_to_bun(strip_decoration(c)))
        .filter(|c| looks_like_command(c))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Validate and dedupe a command history. Applying it twice is a no-op.
pub fn validate_and_clean(commands: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    commands
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| looks_like_command(c))
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

/// Whether a command installs packages (retry candidates).
pub fn is_install_command(cmd: &str) -> bool {
    let first = cmd.split_whitespace().next().unwrap_or_default();
    matches!(first, "bun" | "bunx" | "npm" | "npx") && cmd.contains("install")
        || cmd.starts_with("bun add")
        || cmd.starts_with("npm i ")
}

/// Whether a command changes the dependency set (triggers a package.json
/// resync).
pub fn affects_packages(cmd: &str) -> bool {
    is_install_command(cmd)
        || cmd.contains(" add ")
        || cmd.contains("remove")
        || cmd.contains("uninstall")
}

/// Split into execution batches.
pub fn chunk_batches(commands: &[String], size: usize) -> Vec<Vec<String>> {
    commands.chunks(size.max(1)).map(<[String]>::to_vec).collect()
}

/// Render the bootstrap script replayed on cold-start clones.
pub fn render_bootstrap_script(commands: &[String]) -> String {
    let mut script = String::from(
        "#!/usr/bin/env node\n\
         // Replays the project's validated setup commands on a fresh clone.\n\
         const { execSync } = require(\"node:child_process\");\n\
         const commands = [\n",
    );
    for command in commands {
        script.push_str(&format!("  {:?},\n", command));
    }
    script.push_str(
        "];\n\
         for (const command of commands) {\n\
         \x20 console.log(`$ ${command}`);\n\
         \x20 execSync(command, { stdio: \"inherit\" });\n\
         }\n",
    );
    script
}

/// Outcome of the batched execution pipeline.
#[derive(Debug, Default)]
pub struct CommandRunOutcome {
    pub successful: Vec<String>,
    /// Whether any successful command changed the dependency set.
    pub any_package_change: bool,
}

/// Execute commands against the sandbox in batches of [`BATCH_SIZE`].
///
/// A failed batch retries (up to 3 times) only when a failed command is an
/// install, with replacement commands suggested by the setup assistant;
/// otherwise the batch is dropped. `on_output` receives combined output for
/// relay to clients.
pub async fn run_command_pipeline(
    sandbox: &Arc<dyn SandboxApi>,
    session_id: &str,
    ctx: &OperationContext,
    raw: &[String],
    timeout_ms: Option<u64>,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> AppResult<CommandRunOutcome> {
    let commands = normalize_commands(raw);
    let mut outcome = CommandRunOutcome::default();
    if commands.is_empty() {
        return Ok(outcome);
    }

    for batch in chunk_batches(&commands, BATCH_SIZE) {
        let mut attempt_commands = batch;
        let mut retries = 0u32;
        loop {
            let result = sandbox
                .execute_commands(session_id, &attempt_commands, timeout_ms)
                .await?;
            for entry in &result.results {
                if !entry.stdout.is_empty() {
                    on_output(entry.stdout.clone());
                }
                if !entry.stderr.is_empty() {
                    on_output(entry.stderr.clone());
                }
            }
            let failed: Vec<&CommandOutcome> =
                result.results.iter().filter(|r| !r.success).collect();
            for entry in result.results.iter().filter(|r| r.success) {
                if affects_packages(&entry.command) {
                    outcome.any_package_change = true;
                }
                outcome.successful.push(entry.command.clone());
            }
            if failed.is_empty() {
                break;
            }

            let retryable = failed.iter().any(|f| is_install_command(&f.command));
            if !retryable || retries >= MAX_BATCH_RETRIES {
                warn!(dropped = failed.len(), "dropping failed command batch");
                break;
            }
            retries += 1;
            let failed_owned: Vec<CommandOutcome> = failed.into_iter().cloned().collect();
            let alternatives = setup::suggest_alternative_commands(ctx, &failed_owned).await?;
            let alternatives = normalize_commands(&alternatives);
            if alternatives.is_empty() {
                warn!("setup assistant offered no alternatives; dropping batch");
                break;
            }
            debug!(retries, count = alternatives.len(), "retrying batch with alternatives");
            attempt_commands = alternatives;
        }
    }

    Ok(outcome)
}
