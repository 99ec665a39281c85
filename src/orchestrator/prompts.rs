//! Prompt assembly for each phase.
//!
//! Only the structured inputs are built here: objective, plan, feedback,
//! progress. Each prompt ends with the verdict keywords the interpreter
//! understands for that role.

use crate::agent::{AgentRole, PromptContext};
use crate::config::InterpretationMode;
use crate::context::{ExecutionContext, SubmissionKind, TaskContext};
use crate::interpret::{
    ChunkVerdict, CritiqueVerdict, ImplementationVerdict, QualityGateVerdict, RefinementVerdict,
    ReviewVerdict, Verdict,
};

fn with_verdicts<V: Verdict>(prompt: PromptContext, mode: InterpretationMode) -> PromptContext {
    let keywords = V::keywords().join(", ");
    let body = match mode {
        InterpretationMode::NaturalLanguage => {
            format!("End your answer with exactly one of: {}", keywords)
        }
        InterpretationMode::StrictSchema => format!(
            "Answer with a JSON object {{\"verdict\": ..., \"description\": ..., \"files\": [...], \
             \"steps\": [...], \"issues\": [...], \"question\": ...}} where verdict is one of: {}",
            keywords
        ),
    };
    prompt.with_section("Verdict", body)
}

pub fn refinement(task: &TaskContext, mode: InterpretationMode) -> PromptContext {
    let prompt = PromptContext::new(
        AgentRole::Refinement,
        "Sharpen this task into a precise, testable statement. Rewrite it only if that adds clarity; \
         ask one question if it cannot be done without one.",
    )
    .with_section("Task", task.original_task());
    with_verdicts::<RefinementVerdict>(prompt, mode)
}

/// Retry feedback, when set, replaces the task as the objective.
pub fn planning(task: &TaskContext) -> PromptContext {
    let (objective, reference) = task.planning_objective();
    let previous_plan = task.critique_feedback().and(task.plan());
    PromptContext::new(AgentRole::Planning, objective)
        .with_optional_section("Reference (original task, for context only)", reference)
        .with_optional_section("Open question", task.clarifying_question())
        .with_optional_section("Previous plan", previous_plan)
        .with_optional_section("Critique feedback", task.critique_feedback())
}

pub fn plan_critique(task: &TaskContext, mode: InterpretationMode) -> PromptContext {
    let prompt = PromptContext::new(
        AgentRole::PlanCritique,
        "Critique this plan. Approve it, ask for a simpler plan, or reject it.",
    )
    .with_section("Task", task.effective_task())
    .with_optional_section("Plan", task.plan());
    with_verdicts::<CritiqueVerdict>(prompt, mode)
}

pub fn chunking(task: &TaskContext, exec: &ExecutionContext, mode: InterpretationMode) -> PromptContext {
    let progress = exec.progress_summary();
    let prompt = PromptContext::new(
        AgentRole::Chunking,
        "Pick the next bounded unit of work from the plan, or report that the task is complete.",
    )
    .with_section("Task", task.effective_task())
    .with_optional_section("Plan", task.plan())
    .with_section("Completed chunks", progress)
    .with_optional_section("Human feedback", exec.review_feedback());
    with_verdicts::<ChunkVerdict>(prompt, mode)
}

pub fn implementation(task: &TaskContext, exec: &ExecutionContext, mode: InterpretationMode) -> PromptContext {
    let objective = match exec.approved_proposal() {
        Some(_) => "Apply the approved proposal for this chunk.",
        None => "Implement this chunk, or propose an approach first if the change is risky.",
    };
    let prompt = PromptContext::new(AgentRole::Implementation, objective)
        .with_optional_section("Chunk", exec.chunk())
        .with_section("Files", exec.chunk_files().join("\n"))
        .with_optional_section("Approved proposal", exec.approved_proposal())
        .with_optional_section("Review feedback", exec.review_feedback())
        .with_optional_section("Plan", task.plan());
    with_verdicts::<ImplementationVerdict>(prompt, mode)
}

pub fn review(exec: &ExecutionContext, mode: InterpretationMode) -> PromptContext {
    let target = match exec.submission() {
        Some(SubmissionKind::Proposal) => "proposal (nothing has been applied yet)",
        _ => "implementation",
    };
    let prompt = PromptContext::new(
        AgentRole::Review,
        format!("Review this {} for the current chunk.", target),
    )
    .with_optional_section("Chunk", exec.chunk())
    .with_optional_section("Submission", exec.last_output(AgentRole::Implementation))
    .with_section("Files changed", exec.files_changed().join("\n"));
    with_verdicts::<ReviewVerdict>(prompt, mode)
}

pub fn quality_gate(task: &TaskContext, mode: InterpretationMode) -> PromptContext {
    let workspace = task
        .workspace()
        .map(|w| w.path.display().to_string())
        .unwrap_or_default();
    let prompt = PromptContext::new(
        AgentRole::QualityGate,
        "Review the finished work against the task as a whole before it is accepted.",
    )
    .with_section("Task", task.effective_task())
    .with_optional_section("Plan", task.plan())
    .with_section("Workspace", workspace);
    with_verdicts::<QualityGateVerdict>(prompt, mode)
}

pub fn documentation(task: &TaskContext) -> PromptContext {
    PromptContext::new(
        AgentRole::Documentation,
        "Update the project documentation to reflect the completed task.",
    )
    .with_section("Task", task.effective_task())
    .with_optional_section("Plan", task.plan())
    .with_optional_section("Quality gate", task.quality_gate_result())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_feedback_is_the_planning_objective() {
        let mut task = TaskContext::new("t", "Add caching");
        task.set_retry_feedback(Some("add input validation".into()));
        let prompt = planning(&task);
        assert_eq!(prompt.objective, "add input validation");
        assert!(prompt.render().contains("Add caching"));
        assert!(
            prompt
                .section("Reference (original task, for context only)")
                .is_some()
        );
    }

    #[test]
    fn plain_planning_uses_the_task() {
        let task = TaskContext::new("t", "Add caching");
        let prompt = planning(&task);
        assert_eq!(prompt.objective, "Add caching");
        assert!(prompt.sections.is_empty());
    }

    #[test]
    fn verdict_section_lists_role_vocabulary() {
        let exec = ExecutionContext::default();
        let prompt = review(&exec, InterpretationMode::NaturalLanguage);
        let verdicts = prompt.section("Verdict").unwrap();
        assert!(verdicts.contains("approve_continue"));
        assert!(verdicts.contains("needs_human"));

        let strict = review(&exec, InterpretationMode::StrictSchema);
        assert!(strict.section("Verdict").unwrap().contains("JSON"));
    }
}
