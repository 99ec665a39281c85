//! Human decision intake.
//!
//! At an escalation the task records a [`PendingDecision`] and asks a
//! [`DecisionSource`] for a [`HumanDecision`]. A source may have no answer
//! yet; the pending record is checkpointed and the task can be resumed later
//! with the decision supplied from outside (`cadence decide`).

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};

/// Where the task is waiting for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPoint {
    PlanCritique,
    /// The execution loop escalated (review, continuation or interpretation limits).
    Execution,
    FinalReview,
}

impl DecisionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanCritique => "plan_critique",
            Self::Execution => "execution",
            Self::FinalReview => "final_review",
        }
    }

    /// What each decision means at this point, for prompts and status output.
    pub fn choices(&self) -> [&'static str; 3] {
        match self {
            Self::PlanCritique => [
                "Approve the plan and start execution",
                "Re-plan with my feedback",
                "Abandon the task",
            ],
            Self::Execution => [
                "Accept the current chunk and continue",
                "Retry the chunk with my feedback",
                "Abandon the task",
            ],
            Self::FinalReview => [
                "Accept the result as-is",
                "Start a new cycle with my feedback",
                "Abandon the task",
            ],
        }
    }
}

impl fmt::Display for DecisionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_critique" => Ok(Self::PlanCritique),
            "execution" => Ok(Self::Execution),
            "final_review" => Ok(Self::FinalReview),
            _ => anyhow::bail!("Unknown decision point '{}'", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "feedback", rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    RetryWithFeedback(String),
    Abandon,
}

impl HumanDecision {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::RetryWithFeedback(_) => "retry",
            Self::Abandon => "abandon",
        }
    }
}

impl fmt::Display for HumanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryWithFeedback(feedback) => write!(f, "retry: {}", feedback),
            other => f.write_str(other.label()),
        }
    }
}

/// The checkpointed "awaiting human" condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub point: DecisionPoint,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

impl PendingDecision {
    pub fn new(point: DecisionPoint, reason: impl Into<String>) -> Self {
        Self {
            point,
            reason: reason.into(),
            requested_at: Utc::now(),
        }
    }
}

/// Supplies decisions for pending escalations.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// `Ok(None)` means no decision is available now; the task stays pending.
    async fn decide(&self, task_id: &str, pending: &PendingDecision) -> Result<Option<HumanDecision>>;
}

/// Never answers. Used in non-interactive runs so escalations persist.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeferredDecisions;

#[async_trait]
impl DecisionSource for DeferredDecisions {
    async fn decide(&self, _task_id: &str, _pending: &PendingDecision) -> Result<Option<HumanDecision>> {
        Ok(None)
    }
}

/// Answers from a pre-filled queue, then defers.
#[derive(Debug, Default)]
pub struct QueuedDecisions {
    queue: Mutex<VecDeque<HumanDecision>>,
}

impl QueuedDecisions {
    pub fn new(decisions: impl IntoIterator<Item = HumanDecision>) -> Self {
        Self {
            queue: Mutex::new(decisions.into_iter().collect()),
        }
    }

    pub fn push(&self, decision: HumanDecision) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(decision);
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DecisionSource for QueuedDecisions {
    async fn decide(&self, _task_id: &str, _pending: &PendingDecision) -> Result<Option<HumanDecision>> {
        Ok(self.queue.lock().ok().and_then(|mut q| q.pop_front()))
    }
}

/// Prompts on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalDecisions;

impl TerminalDecisions {
    fn prompt(task_id: &str, pending: &PendingDecision) -> Result<HumanDecision> {
        println!();
        println!(
            "{} task {} is waiting at {}",
            style("Decision needed:").yellow().bold(),
            style(task_id).cyan(),
            style(pending.point).bold()
        );
        println!("  {}", pending.reason);
        println!();

        let choices = pending.point.choices();
        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How should the task proceed?")
            .items(&choices)
            .default(0)
            .interact()?;

        match selection {
            0 => Ok(HumanDecision::Approve),
            1 => {
                let feedback: String = Input::with_theme(&ColorfulTheme::default())
                    .with_prompt("Feedback")
                    .validate_with(|input: &String| {
                        if input.trim().is_empty() {
                            Err("feedback must not be empty")
                        } else {
                            Ok(())
                        }
                    })
                    .interact_text()?;
                Ok(HumanDecision::RetryWithFeedback(feedback.trim().to_string()))
            }
            _ => Ok(HumanDecision::Abandon),
        }
    }
}

#[async_trait]
impl DecisionSource for TerminalDecisions {
    async fn decide(&self, task_id: &str, pending: &PendingDecision) -> Result<Option<HumanDecision>> {
        let task_id = task_id.to_string();
        let pending = pending.clone();
        let decision = tokio::task::spawn_blocking(move || Self::prompt(&task_id, &pending)).await??;
        Ok(Some(decision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_serializes_with_feedback_content() {
        let json = serde_json::to_value(HumanDecision::RetryWithFeedback("add input validation".into())).unwrap();
        assert_eq!(json["decision"], "retry_with_feedback");
        assert_eq!(json["feedback"], "add input validation");

        let approve = serde_json::to_value(HumanDecision::Approve).unwrap();
        assert_eq!(approve["decision"], "approve");
    }

    #[test]
    fn decision_point_parses_its_own_name() {
        for point in [DecisionPoint::PlanCritique, DecisionPoint::Execution, DecisionPoint::FinalReview] {
            assert_eq!(point.as_str().parse::<DecisionPoint>().unwrap(), point);
        }
        assert!("lunch".parse::<DecisionPoint>().is_err());
    }

    #[tokio::test]
    async fn queued_source_drains_then_defers() {
        let source = QueuedDecisions::new([HumanDecision::Approve]);
        let pending = PendingDecision::new(DecisionPoint::FinalReview, "quality gate escalated");
        assert_eq!(source.decide("t", &pending).await.unwrap(), Some(HumanDecision::Approve));
        assert_eq!(source.decide("t", &pending).await.unwrap(), None);

        source.push(HumanDecision::Abandon);
        assert_eq!(source.remaining(), 1);
    }

    #[tokio::test]
    async fn deferred_source_never_answers() {
        let pending = PendingDecision::new(DecisionPoint::Execution, "review limit");
        assert_eq!(DeferredDecisions.decide("t", &pending).await.unwrap(), None);
    }

    #[test]
    fn display_includes_feedback() {
        assert_eq!(
            HumanDecision::RetryWithFeedback("more tests".into()).to_string(),
            "retry: more tests"
        );
        assert_eq!(HumanDecision::Abandon.to_string(), "abandon");
    }
}
