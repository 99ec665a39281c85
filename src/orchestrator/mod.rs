//! Drives one task end to end.
//!
//! The orchestrator performs exactly one agent call at a time. After every
//! transition it writes a checkpoint, so a killed process resumes from the
//! last transition that completed. Cancellation abandons the in-flight step
//! without checkpointing it.

pub mod prompts;
mod runner;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{AgentInvoker, RetryPolicy};
use crate::checkpoint::{Checkpoint, CheckpointStore, ProgressCounters, RestoredTask, restore};
use crate::config::{CadenceToml, InterpreterSettings, LimitSettings, PhaseToggles};
use crate::context::TaskContext;
use crate::errors::{OrchestratorError, Result};
use crate::human::{DecisionSource, DeferredDecisions, HumanDecision, PendingDecision};
use crate::interpret::ResponseInterpreter;
use crate::machine::{LoopLimits, TaskPhase, TaskPhaseMachine};
use crate::notify::{NotificationSink, Notifier};
use crate::sandbox::Sandbox;

/// Knobs the driver needs from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub limits: LimitSettings,
    pub phases: PhaseToggles,
    pub interpreter: InterpreterSettings,
    pub retry: RetryPolicy,
    pub archive_on_complete: bool,
}

impl OrchestratorSettings {
    pub fn from_toml(toml: &CadenceToml) -> Self {
        Self {
            limits: toml.limits.clone(),
            phases: toml.phases.clone(),
            interpreter: toml.interpreter.clone(),
            retry: RetryPolicy::from_settings(&toml.agent),
            archive_on_complete: toml.checkpoint.archive_on_complete,
        }
    }

    pub fn loop_limits(&self) -> LoopLimits {
        LoopLimits {
            max_review_attempts: self.limits.max_review_attempts,
            max_implementation_continuations: self.limits.max_implementation_continuations,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_toml(&CadenceToml::default())
    }
}

/// How a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Abandoned,
    /// Escalated with no decision available; resume once one is supplied.
    AwaitingDecision(PendingDecision),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub task_id: String,
    pub outcome: RunOutcome,
    pub phase: TaskPhase,
    pub sequence: u64,
    pub progress: ProgressCounters,
}

/// A task being driven: both machines plus the counters checkpointed with them.
struct TaskRun {
    machine: TaskPhaseMachine,
    progress: ProgressCounters,
    sequence: u64,
}

impl TaskRun {
    fn task_id(&self) -> String {
        self.machine.task_id().to_string()
    }

    /// Apply a human decision. A chunk accepted at the execution point
    /// counts as completed.
    fn apply_decision(&mut self, decision: HumanDecision) -> Result<TaskPhase> {
        let before = self.completed_chunks();
        let phase = self.machine.apply_decision(decision)?;
        self.progress.chunks_completed += self.completed_chunks().saturating_sub(before) as u64;
        Ok(phase)
    }

    fn completed_chunks(&self) -> usize {
        self.machine
            .execution()
            .map_or(0, |exec| exec.context().completed_chunks().len())
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        RunReport {
            task_id: self.task_id(),
            outcome,
            phase: self.machine.phase(),
            sequence: self.sequence,
            progress: self.progress.clone(),
        }
    }
}

pub struct Orchestrator {
    invoker: Arc<dyn AgentInvoker>,
    interpreter: ResponseInterpreter,
    sandbox: Arc<dyn Sandbox>,
    decisions: Arc<dyn DecisionSource>,
    store: CheckpointStore,
    settings: OrchestratorSettings,
    sinks: Vec<Arc<dyn NotificationSink>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Escalations stay pending until a decision source is attached.
    pub fn new(
        invoker: Arc<dyn AgentInvoker>,
        sandbox: Arc<dyn Sandbox>,
        store: CheckpointStore,
        settings: OrchestratorSettings,
    ) -> Self {
        let interpreter = ResponseInterpreter::from_settings(&settings.interpreter, invoker.clone());
        Self {
            invoker,
            interpreter,
            sandbox,
            decisions: Arc::new(DeferredDecisions),
            store,
            settings,
            sinks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: ResponseInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn with_decisions(mut self, decisions: Arc<dyn DecisionSource>) -> Self {
        self.decisions = decisions;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    fn notifier(&self, task_id: &str) -> Notifier {
        self.sinks
            .iter()
            .fold(Notifier::new(task_id), |notifier, sink| notifier.with_sink(sink.clone()))
    }

    /// Start a new task and drive it until it completes, is abandoned, or
    /// waits for a human.
    pub async fn run(&self, task: &str, task_id: Option<&str>) -> Result<RunReport> {
        if task.trim().is_empty() {
            return Err(anyhow::anyhow!("Task description is empty").into());
        }
        let task_id = task_id.map(str::to_string).unwrap_or_else(new_task_id);
        self.store.path_for(&task_id)?;
        if self.store.exists(&task_id) {
            return Err(anyhow::anyhow!(
                "Task {} already has a checkpoint; resume it instead",
                task_id
            )
            .into());
        }

        info!(task_id = %task_id, "starting task");
        let context = TaskContext::new(task_id.clone(), task.trim());
        let mut run = TaskRun {
            machine: TaskPhaseMachine::new(context, self.notifier(&task_id)),
            progress: ProgressCounters::default(),
            sequence: 0,
        };
        self.checkpoint(&mut run)?;
        self.drive(&mut run).await
    }

    /// Continue a task from its checkpoint.
    pub async fn resume(&self, task_id: &str) -> Result<RunReport> {
        let restored = self.load(task_id)?;
        let mut run = TaskRun {
            machine: restored.machine,
            progress: restored.progress,
            sequence: restored.sequence,
        };
        self.invoker
            .resume_sessions(&run.machine.context().session_ids());
        info!(
            task_id,
            phase = %run.machine.phase(),
            sequence = run.sequence,
            "resuming task"
        );
        self.drive(&mut run).await
    }

    /// Validate and rebuild a task from its checkpoint without driving it.
    pub fn load(&self, task_id: &str) -> Result<RestoredTask> {
        let raw = self.store.load_raw(task_id)?;
        Ok(restore(&raw, Some(task_id), self.notifier(task_id))?)
    }

    /// Record a human decision for a pending escalation and checkpoint it.
    pub fn decide(&self, task_id: &str, decision: HumanDecision) -> Result<TaskPhase> {
        let restored = self.load(task_id)?;
        let mut run = TaskRun {
            machine: restored.machine,
            progress: restored.progress,
            sequence: restored.sequence,
        };
        let phase = run.apply_decision(decision)?;
        self.checkpoint(&mut run)?;
        Ok(phase)
    }

    fn checkpoint(&self, run: &mut TaskRun) -> Result<()> {
        run.progress.execution_cycles = u64::from(run.machine.context().cycle());
        let sequence = run.sequence + 1;
        let checkpoint = Checkpoint::capture(&run.machine, &run.progress, sequence)?;
        self.store.save(&checkpoint)?;
        run.sequence = sequence;
        Ok(())
    }

    async fn drive(&self, run: &mut TaskRun) -> Result<RunReport> {
        let task_id = run.task_id();
        loop {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            if let Some(pending) = run.machine.pending().cloned() {
                let decision = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    decision = self.decisions.decide(&task_id, &pending) => decision?,
                };
                match decision {
                    Some(decision) => {
                        run.apply_decision(decision)?;
                        self.checkpoint(run)?;
                        continue;
                    }
                    None => {
                        info!(task_id = %task_id, point = %pending.point, "task is waiting for a human decision");
                        return Ok(run.report(RunOutcome::AwaitingDecision(pending)));
                    }
                }
            }

            match run.machine.phase() {
                TaskPhase::Init => self.step_init(run).await?,
                TaskPhase::Refining => self.step_refining(run).await?,
                TaskPhase::Planning => self.step_planning(run).await?,
                TaskPhase::PlanCritique => self.step_plan_critique(run).await?,
                TaskPhase::Executing => self.step_execution(run).await?,
                TaskPhase::FinalReview => self.step_final_review(run).await?,
                TaskPhase::Documenting => self.step_documenting(run).await?,
                TaskPhase::Finalizing => self.step_finalizing(run).await?,
                TaskPhase::Complete => {
                    if self.settings.archive_on_complete
                        && let Err(e) = self.store.archive(&task_id)
                    {
                        warn!(task_id = %task_id, error = %e, "could not archive checkpoint");
                    }
                    info!(task_id = %task_id, cost_usd = run.progress.cost_usd, "task complete");
                    return Ok(run.report(RunOutcome::Completed));
                }
                TaskPhase::Abandoned => {
                    self.cleanup_best_effort(run).await;
                    info!(task_id = %task_id, "task abandoned");
                    return Ok(run.report(RunOutcome::Abandoned));
                }
            }
            self.checkpoint(run)?;
        }
    }
}

fn new_task_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task-{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &suffix[..6])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::validate;

    #[test]
    fn generated_task_ids_are_valid_file_names() {
        let id = new_task_id();
        assert!(id.starts_with("task-"));
        let store = CheckpointStore::new("/tmp/unused");
        assert!(store.path_for(&id).is_ok());
        assert_ne!(id, new_task_id());
    }

    #[test]
    fn settings_follow_toml() {
        let mut toml = CadenceToml::default();
        toml.limits.max_review_attempts = 7;
        toml.checkpoint.archive_on_complete = false;
        let settings = OrchestratorSettings::from_toml(&toml);
        assert_eq!(settings.loop_limits().max_review_attempts, 7);
        assert!(!settings.archive_on_complete);
    }

    #[test]
    fn report_carries_progress() {
        let machine = TaskPhaseMachine::new(TaskContext::new("t-1", "task"), Notifier::default());
        let run = TaskRun {
            machine,
            progress: ProgressCounters {
                agent_calls: 3,
                ..ProgressCounters::default()
            },
            sequence: 4,
        };
        let report = run.report(RunOutcome::Completed);
        assert_eq!(report.task_id, "t-1");
        assert_eq!(report.progress.agent_calls, 3);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"]["outcome"], "completed");

        let checkpoint = Checkpoint::capture(&run.machine, &run.progress, 1).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&checkpoint.to_json().unwrap()).unwrap();
        assert!(validate(&doc, Some("t-1")).is_ok());
    }
}
