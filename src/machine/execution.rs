//! Execution Loop Machine: chunk, implement, review, repeat.
//!
//! The loop has no terminal state. It reports [`LoopSignal::Completed`] or
//! [`LoopSignal::Escalated`] to the owning phase machine, which decides what
//! happens next. Every operation validates its event against [`transition`]
//! before touching the context, so a rejected event leaves the machine
//! exactly as it was.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::agent::AgentRole;
use crate::context::{ExecutionContext, SubmissionKind};
use crate::errors::TransitionError;
use crate::interpret::{ReviewDecision, ReviewVerdict};
use crate::notify::{MachineKind, Notifier};

const MACHINE: &str = "execution loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Chunking,
    Implementing,
    Reviewing,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 3] = [Self::Chunking, Self::Implementing, Self::Reviewing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chunking => "chunking",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown execution state '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionEvent {
    ChunkAssigned,
    TaskComplete,
    Proposed,
    Implemented,
    ContinueImplementing,
    ProposalApproved,
    ApprovedContinue,
    ApprovedComplete,
    RevisionRequested,
    Escalate,
    HumanAccepted,
    HumanRetry,
}

impl ExecutionEvent {
    pub const ALL: [ExecutionEvent; 12] = [
        Self::ChunkAssigned,
        Self::TaskComplete,
        Self::Proposed,
        Self::Implemented,
        Self::ContinueImplementing,
        Self::ProposalApproved,
        Self::ApprovedContinue,
        Self::ApprovedComplete,
        Self::RevisionRequested,
        Self::Escalate,
        Self::HumanAccepted,
        Self::HumanRetry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChunkAssigned => "chunk_assigned",
            Self::TaskComplete => "task_complete",
            Self::Proposed => "proposed",
            Self::Implemented => "implemented",
            Self::ContinueImplementing => "continue_implementing",
            Self::ProposalApproved => "proposal_approved",
            Self::ApprovedContinue => "approved_continue",
            Self::ApprovedComplete => "approved_complete",
            Self::RevisionRequested => "revision_requested",
            Self::Escalate => "escalate",
            Self::HumanAccepted => "human_accepted",
            Self::HumanRetry => "human_retry",
        }
    }
}

/// What the loop reports upward after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopSignal {
    /// Keep driving the loop.
    Continue,
    /// Every chunk is done; the phase machine moves to final review.
    Completed,
    /// A human decision is required.
    Escalated,
}

/// The transition table.
pub fn transition(
    state: ExecutionState,
    event: ExecutionEvent,
) -> Result<(ExecutionState, LoopSignal), TransitionError> {
    use ExecutionEvent as E;
    use ExecutionState as S;
    use LoopSignal as L;

    let next = match (state, event) {
        (S::Chunking, E::ChunkAssigned) => (S::Implementing, L::Continue),
        (S::Chunking, E::TaskComplete) => (S::Chunking, L::Completed),
        (S::Implementing, E::Proposed) => (S::Reviewing, L::Continue),
        (S::Implementing, E::Implemented) => (S::Reviewing, L::Continue),
        (S::Implementing, E::ContinueImplementing) => (S::Implementing, L::Continue),
        (S::Reviewing, E::ProposalApproved) => (S::Implementing, L::Continue),
        (S::Reviewing, E::ApprovedContinue) => (S::Chunking, L::Continue),
        (S::Reviewing, E::ApprovedComplete) => (S::Reviewing, L::Completed),
        (S::Reviewing, E::RevisionRequested) => (S::Implementing, L::Continue),
        (s, E::Escalate) => (s, L::Escalated),
        (_, E::HumanAccepted) => (S::Chunking, L::Continue),
        (S::Chunking, E::HumanRetry) => (S::Chunking, L::Continue),
        (S::Implementing | S::Reviewing, E::HumanRetry) => (S::Implementing, L::Continue),
        (s, e) => return Err(TransitionError::new(MACHINE, s.as_str(), e.as_str())),
    };
    Ok(next)
}

/// Bounds applied by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_review_attempts: u32,
    pub max_implementation_continuations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLoopMachine {
    state: ExecutionState,
    context: ExecutionContext,
    #[serde(skip)]
    notifier: Notifier,
}

impl ExecutionLoopMachine {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            state: ExecutionState::Chunking,
            context: ExecutionContext::new(notifier.clone()),
            notifier,
        }
    }

    /// Rebuild from persisted parts.
    pub fn restore(state: ExecutionState, mut context: ExecutionContext, notifier: Notifier) -> Self {
        context.attach_notifier(notifier.clone());
        Self {
            state,
            context,
            notifier,
        }
    }

    pub fn attach_notifier(&mut self, notifier: Notifier) {
        self.context.attach_notifier(notifier.clone());
        self.notifier = notifier;
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Record an agent's latest raw output. Not a state transition.
    pub fn record_output(&mut self, role: AgentRole, text: impl Into<String>) {
        self.context.record_output(role, text);
    }

    fn enter(&mut self, next: ExecutionState) {
        let from = self.state;
        self.state = next;
        if from != next {
            self.notifier.state(MachineKind::Execution, from, next);
        }
    }

    pub fn assign_chunk(&mut self, description: String, files: Vec<String>) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::ChunkAssigned)?;
        self.context.begin_chunk(description, files);
        self.enter(next);
        Ok(signal)
    }

    pub fn complete_task(&mut self) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::TaskComplete)?;
        self.enter(next);
        Ok(signal)
    }

    /// Hand a proposal or an applied implementation to review.
    pub fn submit(&mut self, kind: SubmissionKind, files_changed: Vec<String>) -> Result<LoopSignal, TransitionError> {
        let event = match kind {
            SubmissionKind::Proposal => ExecutionEvent::Proposed,
            SubmissionKind::Implementation => ExecutionEvent::Implemented,
        };
        let (next, signal) = transition(self.state, event)?;
        self.context.set_submission(Some(kind));
        if kind == SubmissionKind::Implementation {
            self.context.set_files_changed(files_changed);
        }
        self.enter(next);
        Ok(signal)
    }

    /// The implementation agent needs another pass at the same chunk.
    ///
    /// Escalates once the continuation count exceeds the limit.
    pub fn continue_implementation(&mut self, limits: &LoopLimits) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::ContinueImplementing)?;
        let count = self.context.attempts(AgentRole::Implementation) + 1;
        if count > limits.max_implementation_continuations {
            return self.escalate(format!(
                "implementation agent asked to continue {} times on the same chunk",
                count
            ));
        }
        self.context.increment_attempts(AgentRole::Implementation);
        self.enter(next);
        Ok(signal)
    }

    /// Apply a review verdict.
    ///
    /// Approving a proposal sends the loop back to implementation to apply it.
    /// Revise and reject count against the per-chunk bound; exceeding it
    /// escalates instead of looping.
    pub fn review(&mut self, decision: &ReviewDecision, limits: &LoopLimits) -> Result<LoopSignal, TransitionError> {
        let is_proposal = self.context.submission() == Some(SubmissionKind::Proposal);

        match decision.verdict {
            ReviewVerdict::NeedsHuman => self.escalate(
                decision
                    .summary
                    .clone()
                    .unwrap_or_else(|| "review agent requested a human decision".to_string()),
            ),
            ReviewVerdict::Revise | ReviewVerdict::Reject => {
                let (next, signal) = transition(self.state, ExecutionEvent::RevisionRequested)?;
                let attempts = self.context.attempts(AgentRole::Review) + 1;
                if attempts > limits.max_review_attempts {
                    return self.escalate(format!(
                        "review requested changes {} times on the same chunk",
                        attempts
                    ));
                }
                self.context.increment_attempts(AgentRole::Review);
                self.context.set_review_feedback(Some(review_feedback(decision)));
                if decision.verdict == ReviewVerdict::Reject {
                    self.context.set_approved_proposal(None);
                    self.context.set_files_changed(Vec::new());
                }
                self.enter(next);
                Ok(signal)
            }
            ReviewVerdict::ApproveContinue | ReviewVerdict::ApproveComplete if is_proposal => {
                let (next, signal) = transition(self.state, ExecutionEvent::ProposalApproved)?;
                let proposal = self
                    .context
                    .last_output(AgentRole::Implementation)
                    .map(str::to_string);
                self.context.set_approved_proposal(proposal);
                self.context.set_review_feedback(None);
                self.enter(next);
                Ok(signal)
            }
            ReviewVerdict::ApproveContinue => {
                let (next, signal) = transition(self.state, ExecutionEvent::ApprovedContinue)?;
                self.context.complete_chunk();
                self.enter(next);
                Ok(signal)
            }
            ReviewVerdict::ApproveComplete | ReviewVerdict::AlreadyComplete => {
                let (next, signal) = transition(self.state, ExecutionEvent::ApprovedComplete)?;
                self.context.complete_chunk();
                self.enter(next);
                Ok(signal)
            }
        }
    }

    /// Stop and ask a human. The state is kept so the loop resumes in place.
    pub fn escalate(&mut self, reason: impl Into<String>) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::Escalate)?;
        self.context.flag_needs_human(reason);
        self.enter(next);
        Ok(signal)
    }

    /// Human accepted the current chunk as it stands.
    pub fn human_accept(&mut self) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::HumanAccepted)?;
        self.context.complete_chunk();
        self.context.clear_needs_human();
        self.enter(next);
        Ok(signal)
    }

    /// Human asked for another attempt with feedback; per-chunk counters reset.
    pub fn human_retry(&mut self, feedback: String) -> Result<LoopSignal, TransitionError> {
        let (next, signal) = transition(self.state, ExecutionEvent::HumanRetry)?;
        self.context.reset_attempts();
        self.context.set_review_feedback(Some(feedback));
        self.context.clear_needs_human();
        self.enter(next);
        Ok(signal)
    }
}

fn review_feedback(decision: &ReviewDecision) -> String {
    let mut feedback = decision.feedback.clone();
    if !decision.issues.is_empty() && !decision.issues.iter().all(|i| feedback.contains(i.as_str())) {
        feedback.push_str("\n\nIssues:\n");
        for issue in &decision.issues {
            feedback.push_str(&format!("- {}\n", issue));
        }
    }
    feedback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemorySink;
    use std::sync::Arc;

    const LIMITS: LoopLimits = LoopLimits {
        max_review_attempts: 3,
        max_implementation_continuations: 2,
    };

    fn review(verdict: ReviewVerdict) -> ReviewDecision {
        ReviewDecision {
            verdict,
            summary: None,
            issues: vec![],
            feedback: format!("{} because reasons", verdict),
        }
    }

    fn at_review(kind: SubmissionKind) -> ExecutionLoopMachine {
        let mut machine = ExecutionLoopMachine::new(Notifier::default());
        machine.assign_chunk("Add validation".into(), vec![]).unwrap();
        machine.record_output(AgentRole::Implementation, "proposal text");
        machine.submit(kind, vec!["src/lib.rs".into()]).unwrap();
        machine
    }

    #[test]
    fn table_is_total_over_states_and_events() {
        let mut defined = 0;
        for state in ExecutionState::ALL {
            for event in ExecutionEvent::ALL {
                match transition(state, event) {
                    Ok(_) => defined += 1,
                    Err(err) => {
                        assert_eq!(err.machine, MACHINE);
                        assert_eq!(err.state, state.as_str());
                        assert_eq!(err.event, event.as_str());
                    }
                }
                // Same input, same answer.
                assert_eq!(transition(state, event), transition(state, event));
            }
        }
        assert_eq!(defined, 18);
    }

    #[test]
    fn rejected_event_leaves_machine_untouched() {
        let mut machine = ExecutionLoopMachine::new(Notifier::default());
        let before = machine.clone();
        let err = machine.submit(SubmissionKind::Implementation, vec!["a.rs".into()]).unwrap_err();
        assert_eq!(err.state, "chunking");
        assert_eq!(machine, before);
    }

    #[test]
    fn proposal_approval_returns_to_implementing() {
        let mut machine = at_review(SubmissionKind::Proposal);
        let signal = machine.review(&review(ReviewVerdict::ApproveContinue), &LIMITS).unwrap();
        assert_eq!(signal, LoopSignal::Continue);
        assert_eq!(machine.state(), ExecutionState::Implementing);
        assert_eq!(machine.context().approved_proposal(), Some("proposal text"));
        assert!(machine.context().completed_chunks().is_empty());
    }

    #[test]
    fn implementation_approval_continue_goes_to_chunking() {
        let mut machine = at_review(SubmissionKind::Implementation);
        let signal = machine.review(&review(ReviewVerdict::ApproveContinue), &LIMITS).unwrap();
        assert_eq!(signal, LoopSignal::Continue);
        assert_eq!(machine.state(), ExecutionState::Chunking);
        assert_eq!(machine.context().completed_chunks(), ["Add validation".to_string()]);
    }

    #[test]
    fn already_complete_completes_even_for_proposal() {
        let mut machine = at_review(SubmissionKind::Proposal);
        let signal = machine.review(&review(ReviewVerdict::AlreadyComplete), &LIMITS).unwrap();
        assert_eq!(signal, LoopSignal::Completed);
    }

    #[test]
    fn revisions_past_bound_escalate() {
        let mut machine = at_review(SubmissionKind::Implementation);
        for attempt in 1..=3 {
            let signal = machine.review(&review(ReviewVerdict::Revise), &LIMITS).unwrap();
            assert_eq!(signal, LoopSignal::Continue);
            assert_eq!(machine.context().attempts(AgentRole::Review), attempt);
            machine.submit(SubmissionKind::Implementation, vec![]).unwrap();
        }
        let signal = machine.review(&review(ReviewVerdict::Reject), &LIMITS).unwrap();
        assert_eq!(signal, LoopSignal::Escalated);
        assert_eq!(machine.state(), ExecutionState::Reviewing);
        assert!(machine.context().needs_human());
    }

    #[test]
    fn reject_discards_attempt() {
        let mut machine = at_review(SubmissionKind::Implementation);
        machine.review(&review(ReviewVerdict::Reject), &LIMITS).unwrap();
        assert!(machine.context().files_changed().is_empty());
        assert!(machine.context().review_feedback().unwrap().contains("reject"));
    }

    #[test]
    fn needs_human_escalates_in_place() {
        let mut machine = at_review(SubmissionKind::Implementation);
        let signal = machine.review(&review(ReviewVerdict::NeedsHuman), &LIMITS).unwrap();
        assert_eq!(signal, LoopSignal::Escalated);
        assert_eq!(machine.state(), ExecutionState::Reviewing);
    }

    #[test]
    fn continuation_bound_escalates() {
        let mut machine = ExecutionLoopMachine::new(Notifier::default());
        machine.assign_chunk("chunk".into(), vec![]).unwrap();
        assert_eq!(machine.continue_implementation(&LIMITS).unwrap(), LoopSignal::Continue);
        assert_eq!(machine.continue_implementation(&LIMITS).unwrap(), LoopSignal::Continue);
        assert_eq!(machine.continue_implementation(&LIMITS).unwrap(), LoopSignal::Escalated);
    }

    #[test]
    fn human_retry_resets_counters() {
        let mut machine = at_review(SubmissionKind::Implementation);
        machine.review(&review(ReviewVerdict::Revise), &LIMITS).unwrap();
        machine.submit(SubmissionKind::Implementation, vec![]).unwrap();
        machine.escalate("stuck").unwrap();

        machine.human_retry("use a HashMap".into()).unwrap();
        assert_eq!(machine.state(), ExecutionState::Implementing);
        assert_eq!(machine.context().attempts(AgentRole::Review), 0);
        assert_eq!(machine.context().review_feedback(), Some("use a HashMap"));
        assert!(!machine.context().needs_human());
    }

    #[test]
    fn human_accept_completes_chunk() {
        let mut machine = at_review(SubmissionKind::Implementation);
        machine.escalate("unsure").unwrap();
        machine.human_accept().unwrap();
        assert_eq!(machine.state(), ExecutionState::Chunking);
        assert_eq!(machine.context().completed_chunks().len(), 1);
    }

    #[test]
    fn state_changes_are_published() {
        let sink = Arc::new(MemorySink::new());
        let mut machine = ExecutionLoopMachine::new(Notifier::new("t").with_sink(sink.clone()));
        machine.assign_chunk("chunk".into(), vec![]).unwrap();
        machine.submit(SubmissionKind::Proposal, vec![]).unwrap();
        assert_eq!(
            sink.transitions(MachineKind::Execution),
            vec![
                ("chunking".to_string(), "implementing".to_string()),
                ("implementing".to_string(), "reviewing".to_string()),
            ]
        );
    }

    #[test]
    fn state_names_parse() {
        for state in ExecutionState::ALL {
            assert_eq!(state.as_str().parse::<ExecutionState>().unwrap(), state);
        }
        assert!("napping".parse::<ExecutionState>().is_err());
    }
}
