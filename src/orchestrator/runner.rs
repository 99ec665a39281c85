//! One step per phase (and per execution sub-state). Each step makes at
//! most one agent call and applies exactly one transition; the drive loop
//! checkpoints after it returns.

use std::future::Future;

use tracing::{debug, info, warn};

use super::{Orchestrator, TaskRun, prompts};
use crate::agent::{AgentResponse, AgentRole, PromptContext, invoke_with_retry};
use crate::context::SubmissionKind;
use crate::errors::{OrchestratorError, Result, SandboxError, TransitionError};
use crate::human::DecisionPoint;
use crate::interpret::{ImplementationVerdict, Interpretation};
use crate::machine::{ExecutionLoopMachine, ExecutionState, LoopSignal};
use crate::sandbox::WorkspaceInfo;

const DOCUMENTATION_SUMMARY_LEN: usize = 200;

fn execution_mut(run: &mut TaskRun) -> Result<&mut ExecutionLoopMachine, TransitionError> {
    let phase = run.machine.phase();
    run.machine
        .execution_mut()
        .ok_or_else(|| TransitionError::new("task phase", format!("{} (no execution loop)", phase), "step"))
}

impl Orchestrator {
    /// One agent call on the role's session, with transport retries.
    async fn call_agent(&self, run: &mut TaskRun, prompt: PromptContext) -> Result<AgentResponse> {
        let role = prompt.role;
        let session_id = run.machine.context_mut().session_for(role);
        debug!(task_id = %run.machine.task_id(), %role, session_id = %session_id, "invoking agent");

        let response = invoke_with_retry(
            self.invoker.as_ref(),
            role,
            &prompt,
            &session_id,
            &self.settings.retry,
            &self.cancel,
        )
        .await?;

        run.machine.context_mut().record_session_call(role);
        run.progress.record_agent(&response);
        debug!(
            task_id = %run.machine.task_id(),
            %role,
            cost_usd = response.cost_usd,
            duration_ms = response.duration.as_millis() as u64,
            "agent responded"
        );
        Ok(response)
    }

    /// Interpret with the configured number of extra attempts on the same text.
    /// Each attempt races the cancellation token.
    async fn interpret(&self, run: &mut TaskRun, role: AgentRole, raw_text: &str) -> Result<Option<Interpretation>> {
        let attempts = 1 + self.settings.limits.interpretation_retries;
        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                result = self.interpreter.interpret(role, raw_text) => result,
            };
            run.progress.record_classification(&self.interpreter.drain_usage());
            if let Some(interpretation) = result {
                debug!(%role, verdict = interpretation.verdict_keyword(), "response interpreted");
                return Ok(Some(interpretation));
            }
            warn!(
                task_id = %run.machine.task_id(),
                %role,
                "response could not be interpreted (attempt {}/{})",
                attempt,
                attempts
            );
        }
        Ok(None)
    }

    /// Run a sandbox operation with the agent retry policy.
    async fn sandbox_call<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SandboxError>>,
    {
        let policy = &self.settings.retry;
        let mut retries = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                result = op() => result,
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if retries < policy.max_retries => {
                    let wait = policy.backoff(retries);
                    warn!(
                        error = %err,
                        "sandbox {} failed, retrying in {}ms (attempt {}/{})",
                        what,
                        wait.as_millis(),
                        retries + 1,
                        policy.max_retries
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    retries += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// The task's workspace, prepared on first use.
    async fn workspace(&self, run: &mut TaskRun) -> Result<WorkspaceInfo> {
        if let Some(workspace) = run.machine.context().workspace() {
            return Ok(workspace.clone());
        }
        let task_id = run.task_id();
        let id = task_id.as_str();
        let workspace = self
            .sandbox_call("workspace setup", || self.sandbox.ensure_isolated_workspace(id))
            .await?;
        info!(task_id = %task_id, path = %workspace.path.display(), "workspace ready");
        run.machine
            .context_mut()
            .set_workspace(Some(workspace.clone()));
        Ok(workspace)
    }

    pub(super) async fn cleanup_best_effort(&self, run: &TaskRun) {
        let Some(workspace) = run.machine.context().workspace() else {
            return;
        };
        let task_id = run.task_id();
        if let Err(e) = self.sandbox.cleanup(&task_id, &workspace.path).await {
            warn!(task_id = %task_id, error = %e, "workspace cleanup failed");
        }
    }

    pub(super) async fn step_init(&self, run: &mut TaskRun) -> Result<()> {
        self.workspace(run).await?;
        run.machine.start(self.settings.phases.refinement)?;
        Ok(())
    }

    pub(super) async fn step_refining(&self, run: &mut TaskRun) -> Result<()> {
        let prompt = prompts::refinement(run.machine.context(), self.interpreter.mode());
        let response = self.call_agent(run, prompt).await?;
        let decision = match self
            .interpret(run, AgentRole::Refinement, &response.raw_text)
            .await?
        {
            Some(Interpretation::Refinement(decision)) => Some(decision),
            _ => {
                warn!(task_id = %run.machine.task_id(), "continuing with the original task text");
                None
            }
        };
        run.machine.finish_refinement(decision.as_ref())?;
        Ok(())
    }

    pub(super) async fn step_planning(&self, run: &mut TaskRun) -> Result<()> {
        let prompt = prompts::planning(run.machine.context());
        let response = self.call_agent(run, prompt).await?;
        let plan = response.raw_text.trim();
        if plan.is_empty() {
            return Err(anyhow::anyhow!("Planning agent returned an empty plan").into());
        }
        run.machine.finish_planning(plan.to_string())?;
        Ok(())
    }

    pub(super) async fn step_plan_critique(&self, run: &mut TaskRun) -> Result<()> {
        let prompt = prompts::plan_critique(run.machine.context(), self.interpreter.mode());
        let response = self.call_agent(run, prompt).await?;
        match self
            .interpret(run, AgentRole::PlanCritique, &response.raw_text)
            .await?
        {
            Some(Interpretation::PlanCritique(decision)) => {
                run.machine
                    .critique(&decision, self.settings.limits.max_simplifications)?;
            }
            _ => {
                run.machine.escalate(
                    DecisionPoint::PlanCritique,
                    "plan critique response could not be interpreted",
                )?;
            }
        }
        Ok(())
    }

    pub(super) async fn step_execution(&self, run: &mut TaskRun) -> Result<()> {
        let (state, completed_before) = {
            let exec = execution_mut(run)?;
            (exec.state(), exec.context().completed_chunks().len())
        };

        let signal = match state {
            ExecutionState::Chunking => self.step_chunking(run).await?,
            ExecutionState::Implementing => self.step_implementing(run).await?,
            ExecutionState::Reviewing => self.step_reviewing(run).await?,
        };

        let exec = execution_mut(run)?;
        let completed_after = exec.context().completed_chunks().len();
        let reason = exec
            .context()
            .human_context()
            .unwrap_or("execution loop escalated")
            .to_string();
        run.progress.chunks_completed += completed_after.saturating_sub(completed_before) as u64;

        match signal {
            LoopSignal::Continue => {}
            LoopSignal::Completed => {
                run.machine.execution_completed()?;
            }
            LoopSignal::Escalated => {
                run.machine.escalate(DecisionPoint::Execution, reason)?;
            }
        }
        Ok(())
    }

    async fn step_chunking(&self, run: &mut TaskRun) -> Result<LoopSignal> {
        let prompt = {
            let exec = execution_mut(run)?.context().clone();
            prompts::chunking(run.machine.context(), &exec, self.interpreter.mode())
        };
        let response = self.call_agent(run, prompt).await?;
        execution_mut(run)?.record_output(AgentRole::Chunking, &response.raw_text);

        let signal = match self
            .interpret(run, AgentRole::Chunking, &response.raw_text)
            .await?
        {
            Some(Interpretation::Chunking(decision)) if decision.is_task_complete() => {
                info!(task_id = %run.machine.task_id(), "chunking agent reports the task complete");
                execution_mut(run)?.complete_task()?
            }
            Some(Interpretation::Chunking(decision)) => {
                let chunk = decision.chunk_text();
                info!(
                    task_id = %run.machine.task_id(),
                    chunk = chunk.lines().next().unwrap_or_default(),
                    "next chunk assigned"
                );
                execution_mut(run)?.assign_chunk(chunk, decision.files)?
            }
            _ => execution_mut(run)?.escalate("chunking response could not be interpreted")?,
        };
        Ok(signal)
    }

    async fn step_implementing(&self, run: &mut TaskRun) -> Result<LoopSignal> {
        let prompt = {
            let exec = execution_mut(run)?.context().clone();
            prompts::implementation(run.machine.context(), &exec, self.interpreter.mode())
        };
        let response = self.call_agent(run, prompt).await?;
        execution_mut(run)?.record_output(AgentRole::Implementation, &response.raw_text);

        let limits = self.settings.loop_limits();
        let signal = match self
            .interpret(run, AgentRole::Implementation, &response.raw_text)
            .await?
        {
            Some(Interpretation::Implementation(decision)) => {
                let exec = execution_mut(run)?;
                match decision.verdict {
                    ImplementationVerdict::Propose => exec.submit(SubmissionKind::Proposal, Vec::new())?,
                    ImplementationVerdict::Implemented => {
                        exec.submit(SubmissionKind::Implementation, decision.files_changed)?
                    }
                    ImplementationVerdict::Continue => exec.continue_implementation(&limits)?,
                }
            }
            _ => execution_mut(run)?.escalate("implementation response could not be interpreted")?,
        };
        Ok(signal)
    }

    /// An unreadable review escalates; it is never taken as approval.
    async fn step_reviewing(&self, run: &mut TaskRun) -> Result<LoopSignal> {
        let prompt = prompts::review(execution_mut(run)?.context(), self.interpreter.mode());
        let response = self.call_agent(run, prompt).await?;
        execution_mut(run)?.record_output(AgentRole::Review, &response.raw_text);

        let Some(Interpretation::Review(decision)) = self
            .interpret(run, AgentRole::Review, &response.raw_text)
            .await?
        else {
            return Ok(execution_mut(run)?.escalate("review response could not be interpreted")?);
        };

        let applied = execution_mut(run)?.context().submission() == Some(SubmissionKind::Implementation);
        if decision.is_approval() && applied {
            self.commit_chunk(run).await?;
        }
        Ok(execution_mut(run)?.review(&decision, &self.settings.loop_limits())?)
    }

    async fn commit_chunk(&self, run: &mut TaskRun) -> Result<()> {
        let workspace = self.workspace(run).await?;
        let chunk = execution_mut(run)?
            .context()
            .chunk()
            .and_then(|c| c.lines().next())
            .unwrap_or("chunk")
            .trim()
            .to_string();
        let message = format!("cadence({}): {}", run.machine.task_id(), chunk);
        let path = workspace.path.as_path();
        let commit = self
            .sandbox_call("commit", || self.sandbox.commit(path, &message))
            .await?;
        if let Some(commit) = commit {
            info!(task_id = %run.machine.task_id(), commit = %commit, "chunk committed");
        }
        Ok(())
    }

    pub(super) async fn step_final_review(&self, run: &mut TaskRun) -> Result<()> {
        let prompt = prompts::quality_gate(run.machine.context(), self.interpreter.mode());
        let response = self.call_agent(run, prompt).await?;
        match self
            .interpret(run, AgentRole::QualityGate, &response.raw_text)
            .await?
        {
            Some(Interpretation::QualityGate(decision)) => {
                run.machine.quality_gate(&decision)?;
            }
            _ => {
                run.machine.escalate(
                    DecisionPoint::FinalReview,
                    "quality gate response could not be interpreted",
                )?;
            }
        }
        Ok(())
    }

    /// A failed documentation update is recorded, never fatal.
    pub(super) async fn step_documenting(&self, run: &mut TaskRun) -> Result<()> {
        if !self.settings.phases.documentation {
            run.machine.finish_documentation("skipped".to_string())?;
            return Ok(());
        }
        let prompt = prompts::documentation(run.machine.context());
        let result = match self.call_agent(run, prompt).await {
            Ok(response) => format!("updated: {}", summarize(&response.raw_text)),
            Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => {
                warn!(task_id = %run.machine.task_id(), error = %e, "documentation update failed, finalizing anyway");
                format!("failed: {}", e)
            }
        };
        run.machine.finish_documentation(result)?;
        Ok(())
    }

    pub(super) async fn step_finalizing(&self, run: &mut TaskRun) -> Result<()> {
        let workspace = self.workspace(run).await?;
        let task_id = run.task_id();
        let id = task_id.as_str();
        let path = workspace.path.as_path();
        let message = format!("cadence({}): {}", id, summarize(run.machine.context().effective_task()));

        self.sandbox_call("commit", || self.sandbox.commit(path, &message))
            .await?;
        self.sandbox_call("merge", || self.sandbox.merge_to_primary(id, path))
            .await?;
        self.sandbox_call("cleanup", || self.sandbox.cleanup(id, path))
            .await?;
        run.machine.finalize()?;
        Ok(())
    }
}

/// First non-empty line, truncated on a char boundary.
fn summarize(text: &str) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    match line.char_indices().nth(DOCUMENTATION_SUMMARY_LEN) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarize_takes_first_line_and_truncates() {
        assert_eq!(summarize("\n  Updated README  \nmore"), "Updated README");
        let long = "é".repeat(DOCUMENTATION_SUMMARY_LEN + 5);
        let summary = summarize(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), DOCUMENTATION_SUMMARY_LEN + 3);
        assert_eq!(summarize(""), "");
    }
}
