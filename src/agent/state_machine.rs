//! Phase State Machine
//!
//! Drives one generation run through its lifecycle:
//!
//! ```text
//! IDLE → PHASE_GENERATING ⇄ PHASE_IMPLEMENTING → FINALIZING → REVIEWING → IDLE
//! ```
//!
//! Entry rules on `generate_all_files`:
//! 1. any non-completed phase resumes at `PHASE_IMPLEMENTING`,
//! 2. else an existing phase list starts at `PHASE_GENERATING`,
//! 3. else the blueprint's initial phase is seeded and implemented.
//!
//! Rate-limit errors bubble to the run boundary as `rate_limit_error`; any
//! other error ends the run with an `error` emission. Every exit returns to
//! `IDLE`.

use std::sync::Arc;

use appforge_core::events::AgentEvent;
use appforge_llm::LlmError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::commands;
use crate::agent::AgentDeps;
use crate::models::conversation::{ConversationMessage, INTERNAL_MEMO};
use crate::models::phase::{GeneratedFile, PhaseConcept};
use crate::models::state::{AgentMode, DevState};
use crate::services::operations::phase_implementation::{self, ImplementPhaseRequest};
use crate::services::operations::phase_planning::{self, PhasePlan, UserContext};
use crate::services::operations::{deterministic_fixer, fast_fixer, OperationContext};
use crate::services::registry::AppUpdate;
use crate::services::sandbox::{AnalysisIssue, DeployOptions, SandboxFile, StaticAnalysis};
use crate::utils::error::{AppError, AppResult};

/// Default review-cycle budget.
pub const DEFAULT_REVIEW_CYCLES: u32 = 5;

/// The phase lifecycle driver. Stateless itself; everything lives in the
/// store so a run can resume after a restart.
pub struct StateMachine;

impl StateMachine {
    /// Execute one full run. Always lands back on `IDLE`; rate limits and
    /// cancellation get their own handling at this boundary.
    pub async fn run(
        deps: &Arc<AgentDeps>,
        cancel: CancellationToken,
        review_cycles: u32,
    ) -> AppResult<()> {
        deps.store.mutate(|s| s.review_cycles = Some(review_cycles))?;
        deps.broadcaster.broadcast(&AgentEvent::GenerationStarted);

        let result = Self::drive(deps, &cancel).await;

        Self::set_dev_state(deps, DevState::Idle)?;
        match result {
            Ok(()) => {
                if let Err(e) = deps
                    .registry
                    .update_app(deps.store.project_id(), AppUpdate::status("completed"))
                    .await
                {
                    warn!(error = %e, "registry completion update failed");
                }
                deps.broadcaster.broadcast(&AgentEvent::GenerationComplete);
                Ok(())
            }
            Err(AppError::Inference(LlmError::Cancelled)) => {
                // stop_generation already broadcast generation_stopped.
                info!("run cancelled");
                Ok(())
            }
            Err(e) if e.is_rate_limit() => {
                deps.broadcaster.broadcast(&AgentEvent::RateLimitError {
                    details: e.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                deps.broadcaster.broadcast(&AgentEvent::Error {
                    message: e.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn drive(deps: &Arc<AgentDeps>, cancel: &CancellationToken) -> AppResult<()> {
        let mut current = Self::entry_state(deps)?;
        let mut outstanding: Vec<AnalysisIssue> = Vec::new();
        let mut pending_plan: Option<PhasePlan> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled.into());
            }
            Self::set_dev_state(deps, current)?;

            match current {
                DevState::PhaseGenerating => {
                    deps.broadcaster.broadcast(&AgentEvent::PhaseGenerating {
                        message: "Planning next phase".to_string(),
                    });
                    let suggestions = Self::drain_pending_inputs(deps)?;
                    let is_user_suggested = !suggestions.is_empty();
                    let ctx = Self::op_context(deps, cancel);
                    let user_ctx = UserContext {
                        suggestions,
                        images: Vec::new(),
                    };
                    match phase_planning::plan_next_phase(
                        &ctx,
                        &outstanding,
                        &user_ctx,
                        is_user_suggested,
                    )
                    .await?
                    {
                        Some(plan) => {
                            deps.store.mutate(|s| {
                                s.upsert_phase(plan.phase.clone());
                                s.current_phase = Some(plan.phase.clone());
                            })?;
                            deps.broadcaster.broadcast(&AgentEvent::PhaseGenerated {
                                phase: serde_json::to_value(&plan.phase)?,
                            });
                            pending_plan = Some(plan);
                            current = DevState::PhaseImplementing;
                        }
                        None => current = DevState::Finalizing,
                    }
                }

                DevState::PhaseImplementing => {
                    let Some(phase) = Self::current_phase(deps)? else {
                        current = DevState::PhaseGenerating;
                        continue;
                    };
                    outstanding = Self::implement_one_phase(
                        deps,
                        cancel,
                        &phase,
                        std::mem::take(&mut outstanding),
                        pending_plan.take(),
                    )
                    .await?;

                    let state = deps.store.snapshot();
                    let exhausted =
                        state.phases_counter <= 0 && state.pending_user_inputs.is_empty();
                    current = if phase.last_phase || exhausted {
                        DevState::Finalizing
                    } else {
                        DevState::PhaseGenerating
                    };
                }

                DevState::Finalizing => {
                    if !deps.store.snapshot().mvp_generated {
                        Self::finalize(deps, cancel, &outstanding).await?;
                        deps.store.mutate(|s| s.mvp_generated = true)?;
                    }
                    current = DevState::Reviewing;
                }

                DevState::Reviewing => {
                    Self::review(deps, cancel).await?;
                    return Ok(());
                }

                DevState::Idle => return Ok(()),
            }
        }
    }

    /// Apply the entry rules and seed the current phase when needed.
    fn entry_state(deps: &Arc<AgentDeps>) -> AppResult<DevState> {
        let state = deps.store.snapshot();
        if let Some(phase) = state.last_incomplete_phase() {
            let phase = phase.clone();
            deps.store.mutate(|s| s.current_phase = Some(phase.clone()))?;
            return Ok(DevState::PhaseImplementing);
        }
        if !state.generated_phases.is_empty() {
            return Ok(DevState::PhaseGenerating);
        }
        let blueprint = state
            .blueprint
            .ok_or_else(|| AppError::validation("cannot generate without a blueprint"))?;
        let mut phase = blueprint.initial_phase;
        phase.completed = false;
        deps.broadcaster.broadcast(&AgentEvent::PhaseGenerating {
            message: format!("Preparing initial phase: {}", phase.name),
        });
        deps.store.mutate(|s| {
            s.upsert_phase(phase.clone());
            s.current_phase = Some(phase.clone());
        })?;
        deps.broadcaster.broadcast(&AgentEvent::PhaseGenerated {
            phase: serde_json::to_value(&phase)?,
        });
        Ok(DevState::PhaseImplementing)
    }

    async fn implement_one_phase(
        deps: &Arc<AgentDeps>,
        cancel: &CancellationToken,
        phase: &PhaseConcept,
        issues: Vec<AnalysisIssue>,
        plan: Option<PhasePlan>,
    ) -> AppResult<Vec<AnalysisIssue>> {
        deps.broadcaster.broadcast(&AgentEvent::PhaseImplementing {
            phase: serde_json::to_value(phase)?,
        });

        if let Some(plan) = plan {
            if !plan.files_to_delete.is_empty() {
                deps.files.delete_files(&plan.files_to_delete)?;
            }
            if !plan.install_commands.is_empty() {
                Self::run_commands(deps, cancel, &plan.install_commands).await?;
            }
        }

        let suggestions = Self::drain_pending_inputs(deps)?;
        let ctx = Self::op_context(deps, cancel);
        let realtime_fixing = ctx.state.agent_mode == AgentMode::Smart;
        let broadcaster = Arc::clone(&deps.broadcaster);
        let on_event = move |event: AgentEvent| broadcaster.broadcast(&event);

        let implemented = phase_implementation::implement_phase(
            &ctx,
            ImplementPhaseRequest {
                phase: phase.clone(),
                issues,
                is_first_phase: !ctx.state.generated_phases.iter().any(|p| p.completed),
                user_context: UserContext {
                    suggestions,
                    images: Vec::new(),
                },
            },
            realtime_fixing,
            &on_event,
        )
        .await?;

        // Realtime fixes land in the same save as the phase itself.
        let mut files = implemented.files;
        for handle in implemented.fixed_file_handles {
            match handle.await {
                Ok(fixed) => {
                    if let Some(slot) = files.iter_mut().find(|f| f.path == fixed.path) {
                        *slot = fixed;
                    }
                }
                Err(e) => warn!(error = %e, "realtime fixer task panicked"),
            }
        }

        if !implemented.commands.is_empty() {
            Self::run_commands(deps, cancel, &implemented.commands).await?;
        }

        deps.broadcaster.broadcast(&AgentEvent::PhaseValidating {
            name: phase.name.clone(),
        });
        let analysis = Self::static_analysis(deps).await;
        deps.broadcaster
            .broadcast(&AgentEvent::StaticAnalysisResults {
                lint: serde_json::to_value(&analysis.lint)?,
                typecheck: serde_json::to_value(&analysis.typecheck)?,
            });
        deps.broadcaster.broadcast(&AgentEvent::PhaseValidated {
            name: phase.name.clone(),
            issue_count: analysis.issue_count(),
        });

        if !files.is_empty() && implemented.deployment_needed {
            deps.files
                .save_generated_files(files, Some(&phase.name))?;
            Self::deploy(deps, &phase.name).await;
            Self::post_phase_fixing(deps, cancel, &analysis).await?;
        }

        deps.store.mutate(|s| {
            s.mark_phase_completed(&phase.id);
            s.phases_counter -= 1;
        })?;
        deps.broadcaster.broadcast(&AgentEvent::PhaseImplemented {
            phase: serde_json::to_value(phase)?,
        });

        let mut outstanding = analysis.lint.issues;
        outstanding.extend(analysis.typecheck.issues);
        Ok(outstanding)
    }

    /// Deploy the full file union with the phase name as commit message.
    async fn deploy(deps: &Arc<AgentDeps>, phase_name: &str) {
        deps.broadcaster.broadcast(&AgentEvent::DeploymentStarted {
            message: format!("Deploying {phase_name}"),
        });
        let files: Vec<SandboxFile> = deps
            .files
            .get_all_files()
            .into_iter()
            .map(|(path, contents)| SandboxFile { path, contents })
            .collect();
        let options = DeployOptions {
            redeploy: false,
            clear_logs: false,
            commit_message: Some(phase_name.to_string()),
        };
        match deps.deployment.deploy(&deps.store, files, options).await {
            Ok(result) => {
                deps.broadcaster.broadcast(&AgentEvent::DeploymentCompleted {
                    preview_url: result.preview_url,
                    tunnel_url: result.tunnel_url,
                });
            }
            Err(e) => {
                warn!(error = %e, "phase deploy failed");
                deps.broadcaster.broadcast(&AgentEvent::DeploymentFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Post-phase fixing: the deterministic fixer always runs; the LLM fast
    /// fixer only in smart mode and only for what remained unfixable.
    async fn post_phase_fixing(
        deps: &Arc<AgentDeps>,
        cancel: &CancellationToken,
        analysis: &StaticAnalysis,
    ) -> AppResult<()> {
        if analysis.typecheck.issues.is_empty() {
            return Ok(());
        }
        deps.broadcaster
            .broadcast(&AgentEvent::DeterministicCodeFixStarted);

        let all_files = deps.files.get_all_files();
        let fix = deterministic_fixer::deterministic_fix(&all_files, &analysis.typecheck.issues);
        if !fix.modified_files.is_empty() {
            deps.files
                .save_generated_files(fix.modified_files.clone(), Some("Deterministic fixes"))?;
        }
        if !fix.install_commands.is_empty() {
            Self::run_commands(deps, cancel, &fix.install_commands).await?;
        }
        deps.broadcaster
            .broadcast(&AgentEvent::DeterministicCodeFixCompleted {
                fixed_count: fix.fixed_count(),
                unfixable_count: fix.unfixable_issues.len(),
            });

        let smart = deps.store.snapshot().agent_mode == AgentMode::Smart;
        if smart && !fix.unfixable_issues.is_empty() {
            let ctx = Self::op_context(deps, cancel);
            let patched = fast_fixer::fast_code_fixer(
                &ctx,
                &ctx.state.query,
                &fix.unfixable_issues,
                &all_files,
            )
            .await?;
            if !patched.is_empty() {
                deps.files
                    .save_generated_files(patched, Some("Apply code fixes"))?;
            }
        }
        Ok(())
    }

    /// Finalization pass, at most once per project (guarded by
    /// `mvp_generated` at the call site): resolve what the last validation
    /// left open and ship a final deploy.
    async fn finalize(
        deps: &Arc<AgentDeps>,
        cancel: &CancellationToken,
        outstanding: &[AnalysisIssue],
    ) -> AppResult<()> {
        info!(open_issues = outstanding.len(), "finalizing");
        if !outstanding.is_empty() {
            let ctx = Self::op_context(deps, cancel);
            let all_files = deps.files.get_all_files();
            let patched =
                fast_fixer::fast_code_fixer(&ctx, &ctx.state.query, outstanding, &all_files)
                    .await?;
            if !patched.is_empty() {
                deps.files
                    .save_generated_files(patched, Some("Finalization"))?;
            }
        }
        Self::deploy(deps, "Finalization").await;
        Ok(())
    }

    /// First review entry asks the user whether open issues should be
    /// auto-fixed; re-entries fall straight through to idle.
    async fn review(deps: &Arc<AgentDeps>, _cancel: &CancellationToken) -> AppResult<()> {
        if deps.store.snapshot().reviewing_initiated {
            return Ok(());
        }
        deps.store.mutate(|s| s.reviewing_initiated = true)?;

        deps.broadcaster.broadcast(&AgentEvent::CodeReviewing {
            message: "Reviewing generated code".to_string(),
        });
        let analysis = Self::static_analysis(deps).await;
        let issue_count = analysis.issue_count();
        if issue_count > 0 {
            let conversation_id = format!("review-{}", deps.runtime.short_id());
            let question = format!(
                "The review found {issue_count} open issue(s). Should I fix the bugs \
                 automatically? Reply and I will queue the fixes."
            );
            deps.conversation.append(&ConversationMessage::assistant(
                conversation_id.clone(),
                question.clone(),
            ))?;
            deps.conversation.append(&ConversationMessage::assistant(
                format!("memo-{}", deps.runtime.short_id()),
                format!("{INTERNAL_MEMO} review found {issue_count} issue(s)"),
            ))?;
            deps.broadcaster.broadcast(&AgentEvent::ConversationResponse {
                conversation_id,
                content: question,
                tool: None,
            });
        }
        deps.broadcaster.broadcast(&AgentEvent::CodeReviewed {
            review: serde_json::json!({
                "lintIssues": analysis.lint.issues.len(),
                "typecheckIssues": analysis.typecheck.issues.len(),
            }),
        });
        Ok(())
    }

    /// Run the command pipeline, then record history, regenerate the
    /// bootstrap script, and resync package.json when the dependency set
    /// changed.
    async fn run_commands(
        deps: &Arc<AgentDeps>,
        cancel: &CancellationToken,
        raw: &[String],
    ) -> AppResult<()> {
        let session_id = deps.deployment.ensure_session(&deps.store)?;
        let ctx = Self::op_context(deps, cancel);
        let broadcaster = Arc::clone(&deps.broadcaster);
        let on_output = move |output: String| {
            broadcaster.broadcast(&AgentEvent::TerminalOutput { output });
        };

        let outcome = commands::run_command_pipeline(
            &deps.sandbox,
            &session_id,
            &ctx,
            raw,
            Some(crate::utils::timeout::DEFAULT_COMMAND_TIMEOUT_MS),
            &on_output,
        )
        .await?;
        if outcome.successful.is_empty() {
            return Ok(());
        }

        let history = deps.store.mutate(|s| {
            s.commands_history.extend(outcome.successful.clone());
            s.commands_history = commands::validate_and_clean(&s.commands_history);
            s.commands_history.clone()
        })?;
        deps.files.save_generated_files(
            vec![GeneratedFile::new(
                commands::BOOTSTRAP_PATH,
                commands::render_bootstrap_script(&history),
            )
            .with_purpose("replays setup commands on cold-start clones")],
            None,
        )?;

        if outcome.any_package_change {
            Self::sync_package_json(deps, &session_id).await?;
        }
        Ok(())
    }

    /// Pull package.json back from the sandbox after installs and commit it.
    async fn sync_package_json(deps: &Arc<AgentDeps>, session_id: &str) -> AppResult<()> {
        let read = deps
            .sandbox
            .get_files(session_id, &["package.json".to_string()])
            .await?;
        let Some(package_json) = read.files.into_iter().find(|f| f.path == "package.json") else {
            return Ok(());
        };
        deps.store
            .mutate(|s| s.last_package_json = Some(package_json.contents.clone()))?;
        deps.files.save_generated_files(
            vec![GeneratedFile::new("package.json", package_json.contents)
                .with_purpose("project manifest")],
            Some("Sync package.json from sandbox"),
        )?;
        Ok(())
    }

    async fn static_analysis(deps: &Arc<AgentDeps>) -> StaticAnalysis {
        let Ok(session_id) = deps.deployment.ensure_session(&deps.store) else {
            return StaticAnalysis::default();
        };
        match deps.sandbox.run_static_analysis(&session_id, None).await {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(error = %e, "static analysis unavailable");
                StaticAnalysis::default()
            }
        }
    }

    fn current_phase(deps: &Arc<AgentDeps>) -> AppResult<Option<PhaseConcept>> {
        let state = deps.store.snapshot();
        if let Some(phase) = &state.current_phase {
            if !phase.completed {
                return Ok(Some(phase.clone()));
            }
        }
        Ok(state.last_incomplete_phase().cloned())
    }

    fn drain_pending_inputs(deps: &Arc<AgentDeps>) -> AppResult<Vec<String>> {
        deps.store.mutate(|s| std::mem::take(&mut s.pending_user_inputs))
    }

    fn op_context(deps: &Arc<AgentDeps>, cancel: &CancellationToken) -> OperationContext {
        OperationContext {
            state: deps.store.snapshot(),
            template: deps.template_snapshot(),
            provider: Arc::clone(&deps.provider),
            cancel: cancel.clone(),
            runtime: deps.runtime.clone(),
        }
    }

    /// The store's on-change callback broadcasts the `cf_agent_state`
    /// reconciliation event for this (and every other) mutation.
    fn set_dev_state(deps: &Arc<AgentDeps>, dev_state: DevState) -> AppResult<()> {
        deps.store.mutate(|s| s.current_dev_state = dev_state)?;
        Ok(())
    }
}
