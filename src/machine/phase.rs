//! Task Phase Machine.
//!
//! Sequences a task from intake to completion and owns the execution loop
//! while executing. Escalation is a pending-decision flag on the machine: the
//! phase is kept, and only human decisions (or abandon) are accepted until
//! one arrives.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::execution::ExecutionLoopMachine;
use crate::context::TaskContext;
use crate::errors::{OrchestratorError, TransitionError};
use crate::human::{DecisionPoint, HumanDecision, PendingDecision};
use crate::interpret::{
    CritiqueDecision, CritiqueVerdict, QualityGateDecision, RefinementDecision, RefinementVerdict,
};
use crate::notify::{ContextScope, MachineKind, Notifier};

const MACHINE: &str = "task phase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Init,
    Refining,
    Planning,
    PlanCritique,
    Executing,
    FinalReview,
    Documenting,
    Finalizing,
    Complete,
    Abandoned,
}

impl TaskPhase {
    pub const ALL: [TaskPhase; 10] = [
        Self::Init,
        Self::Refining,
        Self::Planning,
        Self::PlanCritique,
        Self::Executing,
        Self::FinalReview,
        Self::Documenting,
        Self::Finalizing,
        Self::Complete,
        Self::Abandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Refining => "refining",
            Self::Planning => "planning",
            Self::PlanCritique => "plan_critique",
            Self::Executing => "executing",
            Self::FinalReview => "final_review",
            Self::Documenting => "documenting",
            Self::Finalizing => "finalizing",
            Self::Complete => "complete",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Abandoned)
    }

    /// The escalation point that belongs to this phase, if any.
    pub fn decision_point(&self) -> Option<DecisionPoint> {
        match self {
            Self::PlanCritique => Some(DecisionPoint::PlanCritique),
            Self::Executing => Some(DecisionPoint::Execution),
            Self::FinalReview => Some(DecisionPoint::FinalReview),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown task phase '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseEvent {
    Start,
    SkipRefinement,
    Refined,
    Planned,
    PlanApproved,
    SimplifyRequested,
    ExecutionCompleted,
    QualityApproved,
    Documented,
    Finalized,
    Escalate,
    HumanApprove,
    HumanRetry,
    Abandon,
}

impl PhaseEvent {
    pub const ALL: [PhaseEvent; 14] = [
        Self::Start,
        Self::SkipRefinement,
        Self::Refined,
        Self::Planned,
        Self::PlanApproved,
        Self::SimplifyRequested,
        Self::ExecutionCompleted,
        Self::QualityApproved,
        Self::Documented,
        Self::Finalized,
        Self::Escalate,
        Self::HumanApprove,
        Self::HumanRetry,
        Self::Abandon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SkipRefinement => "skip_refinement",
            Self::Refined => "refined",
            Self::Planned => "planned",
            Self::PlanApproved => "plan_approved",
            Self::SimplifyRequested => "simplify_requested",
            Self::ExecutionCompleted => "execution_completed",
            Self::QualityApproved => "quality_approved",
            Self::Documented => "documented",
            Self::Finalized => "finalized",
            Self::Escalate => "escalate",
            Self::HumanApprove => "human_approve",
            Self::HumanRetry => "human_retry",
            Self::Abandon => "abandon",
        }
    }
}

/// The transition table. `awaiting` is whether a human decision is pending.
pub fn transition(phase: TaskPhase, awaiting: bool, event: PhaseEvent) -> Result<TaskPhase, TransitionError> {
    use PhaseEvent as E;
    use TaskPhase as P;

    let next = match (awaiting, phase, event) {
        (_, p, E::Abandon) if !p.is_terminal() => P::Abandoned,

        (true, P::PlanCritique, E::HumanApprove) => P::Executing,
        (true, P::PlanCritique, E::HumanRetry) => P::Planning,
        (true, P::Executing, E::HumanApprove | E::HumanRetry) => P::Executing,
        (true, P::FinalReview, E::HumanApprove) => P::Documenting,
        (true, P::FinalReview, E::HumanRetry) => P::Planning,

        (false, P::Init, E::Start) => P::Refining,
        (false, P::Init, E::SkipRefinement) => P::Planning,
        (false, P::Refining, E::Refined) => P::Planning,
        (false, P::Planning, E::Planned) => P::PlanCritique,
        (false, P::PlanCritique, E::PlanApproved) => P::Executing,
        (false, P::PlanCritique, E::SimplifyRequested) => P::Planning,
        (false, P::Executing, E::ExecutionCompleted) => P::FinalReview,
        (false, P::FinalReview, E::QualityApproved) => P::Documenting,
        (false, P::Documenting, E::Documented) => P::Finalizing,
        (false, P::Finalizing, E::Finalized) => P::Complete,
        (false, p @ (P::PlanCritique | P::Executing | P::FinalReview), E::Escalate) => p,

        (awaiting, p, e) => {
            let state = if awaiting {
                format!("{} (awaiting decision)", p)
            } else {
                p.to_string()
            };
            return Err(TransitionError::new(MACHINE, state, e.as_str()));
        }
    };
    Ok(next)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskPhaseMachine {
    phase: TaskPhase,
    context: TaskContext,
    awaiting: Option<PendingDecision>,
    execution: Option<ExecutionLoopMachine>,
    notifier: Notifier,
}

impl TaskPhaseMachine {
    pub fn new(mut context: TaskContext, notifier: Notifier) -> Self {
        context.attach_notifier(notifier.clone());
        Self {
            phase: TaskPhase::Init,
            context,
            awaiting: None,
            execution: None,
            notifier,
        }
    }

    /// Rebuild from validated, persisted parts.
    pub fn restore(
        phase: TaskPhase,
        mut context: TaskContext,
        awaiting: Option<PendingDecision>,
        mut execution: Option<ExecutionLoopMachine>,
        notifier: Notifier,
    ) -> Self {
        context.attach_notifier(notifier.clone());
        if let Some(exec) = execution.as_mut() {
            exec.attach_notifier(notifier.clone());
        }
        Self {
            phase,
            context,
            awaiting,
            execution,
            notifier,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    pub fn task_id(&self) -> &str {
        self.context.task_id()
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    /// Session and workspace bookkeeping only; phase data changes go
    /// through transitions.
    pub fn context_mut(&mut self) -> &mut TaskContext {
        &mut self.context
    }

    pub fn pending(&self) -> Option<&PendingDecision> {
        self.awaiting.as_ref()
    }

    pub fn execution(&self) -> Option<&ExecutionLoopMachine> {
        self.execution.as_ref()
    }

    pub fn execution_mut(&mut self) -> Option<&mut ExecutionLoopMachine> {
        self.execution.as_mut()
    }

    fn check(&self, event: PhaseEvent) -> Result<TaskPhase, TransitionError> {
        transition(self.phase, self.awaiting.is_some(), event)
    }

    fn enter(&mut self, next: TaskPhase) {
        let from = self.phase;
        self.phase = next;
        if next != TaskPhase::Executing {
            self.execution = None;
        } else if self.execution.is_none() {
            self.execution = Some(ExecutionLoopMachine::new(self.notifier.clone()));
            self.context.start_cycle();
        }
        if from != next {
            info!(task_id = %self.context.task_id(), from = %from, to = %next, "phase transition");
            self.notifier.state(MachineKind::Phase, from, next);
        }
    }

    fn set_pending(&mut self, pending: Option<PendingDecision>) {
        self.awaiting = pending;
        self.notifier
            .field(ContextScope::Task, "pending_decision", &self.awaiting);
    }

    pub fn start(&mut self, refinement_enabled: bool) -> Result<TaskPhase, TransitionError> {
        let event = if refinement_enabled {
            PhaseEvent::Start
        } else {
            PhaseEvent::SkipRefinement
        };
        let next = self.check(event)?;
        self.enter(next);
        Ok(next)
    }

    /// Leave refinement. An uninterpretable response (`None`) keeps the
    /// original task text.
    pub fn finish_refinement(&mut self, decision: Option<&RefinementDecision>) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Refined)?;
        if let Some(decision) = decision {
            match decision.verdict {
                RefinementVerdict::Refined => {
                    if let Some(refined) = &decision.refined_task {
                        self.context.set_refined_task(Some(refined.clone()));
                    }
                }
                RefinementVerdict::NeedsClarification => {
                    self.context.set_clarifying_question(decision.question.clone());
                }
                RefinementVerdict::Unchanged => {}
            }
        }
        self.enter(next);
        Ok(next)
    }

    /// Store the plan. Retry feedback has now been consumed and is cleared.
    pub fn finish_planning(&mut self, plan: String) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Planned)?;
        self.context.set_plan(Some(plan));
        if self.context.retry_feedback().is_some() {
            self.context.set_retry_feedback(None);
        }
        self.enter(next);
        Ok(next)
    }

    /// Apply the plan critique.
    ///
    /// A simplify verdict past `max_simplifications` escalates.
    pub fn critique(&mut self, decision: &CritiqueDecision, max_simplifications: u32) -> Result<TaskPhase, TransitionError> {
        match decision.verdict {
            CritiqueVerdict::Approve => {
                let next = self.check(PhaseEvent::PlanApproved)?;
                self.enter(next);
                Ok(next)
            }
            CritiqueVerdict::Simplify if self.context.simplification_attempts() >= max_simplifications => self.escalate(
                DecisionPoint::PlanCritique,
                format!(
                    "plan critique still asks for simplification after {} rounds",
                    self.context.simplification_attempts()
                ),
            ),
            CritiqueVerdict::Simplify => {
                let next = self.check(PhaseEvent::SimplifyRequested)?;
                self.context.increment_simplification_attempts();
                self.context.set_critique_feedback(Some(decision.feedback.clone()));
                self.enter(next);
                Ok(next)
            }
            CritiqueVerdict::Reject => self.escalate(
                DecisionPoint::PlanCritique,
                decision
                    .summary
                    .clone()
                    .unwrap_or_else(|| "plan critique rejected the plan".to_string()),
            ),
            CritiqueVerdict::NeedsHuman => self.escalate(
                DecisionPoint::PlanCritique,
                decision
                    .summary
                    .clone()
                    .unwrap_or_else(|| "plan critique requested a human decision".to_string()),
            ),
        }
    }

    /// Record a pending human decision. The phase does not change.
    pub fn escalate(&mut self, point: DecisionPoint, reason: impl Into<String>) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Escalate)?;
        if self.phase.decision_point() != Some(point) {
            return Err(TransitionError::new(
                MACHINE,
                self.phase.to_string(),
                format!("escalate at {}", point),
            ));
        }
        let reason = reason.into();
        info!(task_id = %self.context.task_id(), point = %point, reason = %reason, "awaiting human decision");
        self.set_pending(Some(PendingDecision::new(point, reason)));
        self.enter(next);
        Ok(next)
    }

    pub fn execution_completed(&mut self) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::ExecutionCompleted)?;
        self.enter(next);
        Ok(next)
    }

    pub fn quality_gate(&mut self, decision: &QualityGateDecision) -> Result<TaskPhase, TransitionError> {
        let summary = decision
            .summary
            .clone()
            .unwrap_or_else(|| decision.feedback.clone());
        if decision.is_approved() {
            let next = self.check(PhaseEvent::QualityApproved)?;
            self.context
                .set_quality_gate_result(Some(format!("{}: {}", decision.verdict, summary)));
            self.enter(next);
            Ok(next)
        } else {
            self.check(PhaseEvent::Escalate)?;
            self.context
                .set_quality_gate_result(Some(format!("{}: {}", decision.verdict, summary)));
            self.escalate(
                DecisionPoint::FinalReview,
                "final quality gate did not approve the result",
            )
        }
    }

    /// Leave documentation. The outcome is recorded whatever it was.
    pub fn finish_documentation(&mut self, result: String) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Documented)?;
        self.context.set_documentation_result(Some(result));
        self.enter(next);
        Ok(next)
    }

    pub fn finalize(&mut self) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Finalized)?;
        self.enter(next);
        Ok(next)
    }

    pub fn abandon(&mut self, reason: &str) -> Result<TaskPhase, TransitionError> {
        let next = self.check(PhaseEvent::Abandon)?;
        info!(task_id = %self.context.task_id(), reason, "abandoning task");
        if self.awaiting.is_some() {
            self.set_pending(None);
        }
        self.enter(next);
        Ok(next)
    }

    /// Resolve the pending escalation.
    pub fn apply_decision(&mut self, decision: HumanDecision) -> Result<TaskPhase, OrchestratorError> {
        let Some(pending) = self.awaiting.clone() else {
            return Err(OrchestratorError::NoPendingDecision(self.task_id().to_string()));
        };
        if let HumanDecision::RetryWithFeedback(feedback) = &decision
            && feedback.trim().is_empty()
        {
            return Err(OrchestratorError::InvalidDecision {
                point: pending.point.to_string(),
                decision: "retry with empty feedback".to_string(),
            });
        }

        let event = match &decision {
            HumanDecision::Approve => PhaseEvent::HumanApprove,
            HumanDecision::RetryWithFeedback(_) => PhaseEvent::HumanRetry,
            HumanDecision::Abandon => PhaseEvent::Abandon,
        };
        let next = self.check(event)?;
        info!(task_id = %self.task_id(), point = %pending.point, decision = decision.label(), "human decision applied");

        match (pending.point, decision) {
            (_, HumanDecision::Abandon) => {}
            (DecisionPoint::PlanCritique, HumanDecision::Approve) => {}
            (DecisionPoint::PlanCritique, HumanDecision::RetryWithFeedback(feedback)) => {
                self.context.set_critique_feedback(Some(feedback));
            }
            (DecisionPoint::Execution, decision) => {
                let Some(exec) = self.execution.as_mut() else {
                    return Err(TransitionError::new(MACHINE, "executing (no execution loop)", event.as_str()).into());
                };
                match decision {
                    HumanDecision::RetryWithFeedback(feedback) => exec.human_retry(feedback)?,
                    _ => exec.human_accept()?,
                };
            }
            (DecisionPoint::FinalReview, HumanDecision::Approve) => {}
            (DecisionPoint::FinalReview, HumanDecision::RetryWithFeedback(feedback)) => {
                self.context.set_critique_feedback(None);
                self.context.reset_simplification_attempts();
                self.context.set_retry_feedback(Some(feedback));
            }
        }

        self.set_pending(None);
        self.enter(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::{QualityGateVerdict, ReviewDecision, ReviewVerdict};
    use crate::machine::execution::{ExecutionState, LoopLimits};
    use crate::notify::MemorySink;
    use std::sync::Arc;

    fn machine() -> (TaskPhaseMachine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let notifier = Notifier::new("t-1").with_sink(sink.clone());
        (
            TaskPhaseMachine::new(TaskContext::new("t-1", "Add caching"), notifier),
            sink,
        )
    }

    fn critique(verdict: CritiqueVerdict) -> CritiqueDecision {
        CritiqueDecision {
            verdict,
            summary: None,
            issues: vec![],
            feedback: "split the plan".into(),
        }
    }

    fn gate(verdict: QualityGateVerdict) -> QualityGateDecision {
        QualityGateDecision {
            verdict,
            summary: Some("checked".into()),
            issues: vec![],
            feedback: String::new(),
        }
    }

    fn at_critique() -> (TaskPhaseMachine, Arc<MemorySink>) {
        let (mut m, sink) = machine();
        m.start(false).unwrap();
        m.finish_planning("1. do it".into()).unwrap();
        (m, sink)
    }

    fn at_final_review() -> TaskPhaseMachine {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        m.execution_completed().unwrap();
        m
    }

    #[test]
    fn table_is_total_and_deterministic() {
        let mut defined = 0;
        for phase in TaskPhase::ALL {
            for awaiting in [false, true] {
                for event in PhaseEvent::ALL {
                    let result = transition(phase, awaiting, event);
                    assert_eq!(result, transition(phase, awaiting, event));
                    if let Err(err) = &result {
                        assert_eq!(err.event, event.as_str());
                    } else {
                        defined += 1;
                    }
                }
            }
        }
        // 10 forward edges, 3 escalations, 6 human edges, 8 phases x 2 abandons.
        assert_eq!(defined, 10 + 3 + 6 + 16);
    }

    #[test]
    fn terminal_phases_accept_nothing() {
        for event in PhaseEvent::ALL {
            assert!(transition(TaskPhase::Complete, false, event).is_err());
            assert!(transition(TaskPhase::Abandoned, true, event).is_err());
        }
    }

    #[test]
    fn happy_path_reaches_complete() {
        let (mut m, sink) = machine();
        m.start(true).unwrap();
        m.finish_refinement(None).unwrap();
        m.finish_planning("1. do it".into()).unwrap();
        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        assert!(m.execution().is_some());
        assert_eq!(m.context().cycle(), 1);
        m.execution_completed().unwrap();
        assert!(m.execution().is_none());
        m.quality_gate(&gate(QualityGateVerdict::Approve)).unwrap();
        m.finish_documentation("updated README".into()).unwrap();
        m.finalize().unwrap();
        assert_eq!(m.phase(), TaskPhase::Complete);

        let phases: Vec<String> = sink
            .transitions(MachineKind::Phase)
            .into_iter()
            .map(|(_, to)| to)
            .collect();
        assert_eq!(
            phases,
            vec![
                "refining",
                "planning",
                "plan_critique",
                "executing",
                "final_review",
                "documenting",
                "finalizing",
                "complete"
            ]
        );
    }

    #[test]
    fn refinement_outcomes() {
        let (mut m, _) = machine();
        m.start(true).unwrap();
        m.finish_refinement(Some(&RefinementDecision {
            verdict: RefinementVerdict::NeedsClarification,
            refined_task: None,
            question: Some("Which cache?".into()),
        }))
        .unwrap();
        assert_eq!(m.context().clarifying_question(), Some("Which cache?"));
        assert_eq!(m.context().effective_task(), "Add caching");

        let (mut m, _) = machine();
        m.start(true).unwrap();
        m.finish_refinement(Some(&RefinementDecision {
            verdict: RefinementVerdict::Refined,
            refined_task: Some("Add an LRU cache".into()),
            question: None,
        }))
        .unwrap();
        assert_eq!(m.context().effective_task(), "Add an LRU cache");
    }

    #[test]
    fn simplify_is_capped_then_escalates() {
        let (mut m, _) = at_critique();
        for round in 1..=2 {
            assert_eq!(
                m.critique(&critique(CritiqueVerdict::Simplify), 2).unwrap(),
                TaskPhase::Planning
            );
            assert_eq!(m.context().simplification_attempts(), round);
            assert_eq!(m.context().critique_feedback(), Some("split the plan"));
            m.finish_planning(format!("plan v{}", round + 1)).unwrap();
        }
        assert_eq!(
            m.critique(&critique(CritiqueVerdict::Simplify), 2).unwrap(),
            TaskPhase::PlanCritique
        );
        assert_eq!(m.pending().unwrap().point, DecisionPoint::PlanCritique);
    }

    #[test]
    fn pending_decision_blocks_ordinary_events() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Reject), 2).unwrap();
        let err = m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap_err();
        assert!(err.state.contains("awaiting decision"));
        assert_eq!(m.phase(), TaskPhase::PlanCritique);
    }

    #[test]
    fn plan_critique_retry_replans_with_feedback() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::NeedsHuman), 2).unwrap();
        m.apply_decision(HumanDecision::RetryWithFeedback("drop the UI part".into()))
            .unwrap();
        assert_eq!(m.phase(), TaskPhase::Planning);
        assert_eq!(m.context().critique_feedback(), Some("drop the UI part"));
        assert_eq!(m.context().simplification_attempts(), 0);
        assert!(m.pending().is_none());
    }

    #[test]
    fn final_review_retry_starts_new_cycle_with_sole_feedback() {
        let mut m = at_final_review();
        m.quality_gate(&gate(QualityGateVerdict::NeedsHuman)).unwrap();
        assert_eq!(m.pending().unwrap().point, DecisionPoint::FinalReview);

        m.apply_decision(HumanDecision::RetryWithFeedback("add input validation".into()))
            .unwrap();
        assert_eq!(m.phase(), TaskPhase::Planning);
        assert_eq!(
            m.context().planning_objective(),
            ("add input validation", Some("Add caching"))
        );

        m.finish_planning("1. validate input".into()).unwrap();
        assert!(m.context().retry_feedback().is_none());

        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        assert_eq!(m.context().cycle(), 2);
    }

    #[test]
    fn final_review_retry_restores_simplification_budget() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Simplify), 2).unwrap();
        m.finish_planning("plan v2".into()).unwrap();
        m.critique(&critique(CritiqueVerdict::Simplify), 2).unwrap();
        m.finish_planning("plan v3".into()).unwrap();
        assert_eq!(m.context().simplification_attempts(), 2);
        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        m.execution_completed().unwrap();
        m.quality_gate(&gate(QualityGateVerdict::NeedsHuman)).unwrap();

        m.apply_decision(HumanDecision::RetryWithFeedback("add input validation".into()))
            .unwrap();
        assert_eq!(m.context().simplification_attempts(), 0);

        // The second cycle may simplify again instead of escalating.
        m.finish_planning("1. validate input".into()).unwrap();
        assert_eq!(
            m.critique(&critique(CritiqueVerdict::Simplify), 2).unwrap(),
            TaskPhase::Planning
        );
        assert!(m.pending().is_none());
        assert_eq!(m.context().simplification_attempts(), 1);
    }

    #[test]
    fn final_review_approve_accepts_as_is() {
        let mut m = at_final_review();
        m.quality_gate(&gate(QualityGateVerdict::NeedsHuman)).unwrap();
        m.apply_decision(HumanDecision::Approve).unwrap();
        assert_eq!(m.phase(), TaskPhase::Documenting);
    }

    #[test]
    fn execution_decisions_drive_the_loop() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        let limits = LoopLimits {
            max_review_attempts: 1,
            max_implementation_continuations: 1,
        };
        let exec = m.execution_mut().unwrap();
        exec.assign_chunk("chunk".into(), vec![]).unwrap();
        exec.submit(crate::context::SubmissionKind::Implementation, vec![])
            .unwrap();
        let decision = ReviewDecision {
            verdict: ReviewVerdict::NeedsHuman,
            summary: None,
            issues: vec![],
            feedback: String::new(),
        };
        exec.review(&decision, &limits).unwrap();
        m.escalate(DecisionPoint::Execution, "review wants a human").unwrap();

        m.apply_decision(HumanDecision::RetryWithFeedback("try again".into()))
            .unwrap();
        assert_eq!(m.phase(), TaskPhase::Executing);
        let exec = m.execution().unwrap();
        assert_eq!(exec.state(), ExecutionState::Implementing);
        assert!(!exec.context().needs_human());
    }

    #[test]
    fn decision_without_escalation_is_rejected() {
        let (mut m, _) = at_critique();
        let err = m.apply_decision(HumanDecision::Approve).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoPendingDecision(_)));
    }

    #[test]
    fn empty_retry_feedback_is_rejected() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Reject), 2).unwrap();
        let err = m
            .apply_decision(HumanDecision::RetryWithFeedback("  ".into()))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDecision { .. }));
        assert!(m.pending().is_some());
    }

    #[test]
    fn escalating_at_wrong_point_is_a_transition_error() {
        let (mut m, _) = at_critique();
        let err = m.escalate(DecisionPoint::FinalReview, "nope").unwrap_err();
        assert_eq!(err.machine, MACHINE);
        assert!(m.pending().is_none());
    }

    #[test]
    fn abandon_clears_pending_and_execution() {
        let (mut m, _) = at_critique();
        m.critique(&critique(CritiqueVerdict::Approve), 2).unwrap();
        m.escalate(DecisionPoint::Execution, "stuck").unwrap();
        m.apply_decision(HumanDecision::Abandon).unwrap();
        assert_eq!(m.phase(), TaskPhase::Abandoned);
        assert!(m.pending().is_none());
        assert!(m.execution().is_none());
        assert!(m.abandon("again").is_err());
    }

    #[test]
    fn phase_names_parse() {
        for phase in TaskPhase::ALL {
            assert_eq!(phase.as_str().parse::<TaskPhase>().unwrap(), phase);
        }
    }
}
