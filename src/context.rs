//! Task and execution context records.
//!
//! Both records are owned by exactly one machine. Fields are private; every
//! mutation goes through a setter that publishes one change notification
//! after the value is committed. A deserialized context publishes nothing
//! until [`TaskContext::attach_notifier`] / [`ExecutionContext::attach_notifier`]
//! hands it the live notifier.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentRole;
use crate::notify::{ContextScope, Notifier};
use crate::sandbox::WorkspaceInfo;

/// A role's conversation with the agent backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    #[serde(default)]
    pub calls: u32,
}

/// Per-task record, alive for the whole task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    task_id: String,
    original_task: String,
    #[serde(default)]
    refined_task: Option<String>,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    critique_feedback: Option<String>,
    /// Set only when the final quality gate sends the task round again.
    #[serde(default)]
    retry_feedback: Option<String>,
    #[serde(default)]
    simplification_attempts: u32,
    #[serde(default)]
    clarifying_question: Option<String>,
    #[serde(default)]
    quality_gate_result: Option<String>,
    #[serde(default)]
    documentation_result: Option<String>,
    #[serde(default)]
    sessions: BTreeMap<AgentRole, AgentSession>,
    #[serde(default)]
    workspace: Option<WorkspaceInfo>,
    /// Execution cycles started, counting from 1 once planning first runs.
    #[serde(default)]
    cycle: u32,
    #[serde(skip)]
    notifier: Notifier,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>, original_task: impl Into<String>) -> Self {
        let task_id = task_id.into();
        Self {
            notifier: Notifier::new(task_id.clone()),
            task_id,
            original_task: original_task.into(),
            refined_task: None,
            plan: None,
            critique_feedback: None,
            retry_feedback: None,
            simplification_attempts: 0,
            clarifying_question: None,
            quality_gate_result: None,
            documentation_result: None,
            sessions: BTreeMap::new(),
            workspace: None,
            cycle: 0,
        }
    }

    pub fn attach_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn original_task(&self) -> &str {
        &self.original_task
    }

    pub fn refined_task(&self) -> Option<&str> {
        self.refined_task.as_deref()
    }

    /// Refined text when refinement produced one, else the original.
    pub fn effective_task(&self) -> &str {
        self.refined_task.as_deref().unwrap_or(&self.original_task)
    }

    pub fn plan(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    pub fn critique_feedback(&self) -> Option<&str> {
        self.critique_feedback.as_deref()
    }

    pub fn retry_feedback(&self) -> Option<&str> {
        self.retry_feedback.as_deref()
    }

    pub fn simplification_attempts(&self) -> u32 {
        self.simplification_attempts
    }

    pub fn clarifying_question(&self) -> Option<&str> {
        self.clarifying_question.as_deref()
    }

    pub fn quality_gate_result(&self) -> Option<&str> {
        self.quality_gate_result.as_deref()
    }

    pub fn documentation_result(&self) -> Option<&str> {
        self.documentation_result.as_deref()
    }

    pub fn workspace(&self) -> Option<&WorkspaceInfo> {
        self.workspace.as_ref()
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn sessions(&self) -> &BTreeMap<AgentRole, AgentSession> {
        &self.sessions
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.values().map(|s| s.id.clone()).collect()
    }

    /// What planning should treat as its objective.
    ///
    /// Retry feedback, when present, is the sole objective; the task text is
    /// then only reference material.
    pub fn planning_objective(&self) -> (&str, Option<&str>) {
        match self.retry_feedback.as_deref() {
            Some(feedback) => (feedback, Some(self.effective_task())),
            None => (self.effective_task(), None),
        }
    }

    fn publish<T: Serialize + ?Sized>(&self, field: &str, value: &T) {
        self.notifier.field(ContextScope::Task, field, value);
    }

    pub fn set_refined_task(&mut self, refined: Option<String>) {
        self.refined_task = refined;
        self.publish("refined_task", &self.refined_task);
    }

    pub fn set_plan(&mut self, plan: Option<String>) {
        self.plan = plan;
        self.publish("plan", &self.plan);
    }

    pub fn set_critique_feedback(&mut self, feedback: Option<String>) {
        self.critique_feedback = feedback;
        self.publish("critique_feedback", &self.critique_feedback);
    }

    pub fn set_retry_feedback(&mut self, feedback: Option<String>) {
        self.retry_feedback = feedback;
        self.publish("retry_feedback", &self.retry_feedback);
    }

    pub fn increment_simplification_attempts(&mut self) -> u32 {
        self.simplification_attempts += 1;
        self.publish("simplification_attempts", &self.simplification_attempts);
        self.simplification_attempts
    }

    /// A new planning cycle gets a fresh simplification budget.
    pub fn reset_simplification_attempts(&mut self) {
        if self.simplification_attempts != 0 {
            self.simplification_attempts = 0;
            self.publish("simplification_attempts", &self.simplification_attempts);
        }
    }

    pub fn set_clarifying_question(&mut self, question: Option<String>) {
        self.clarifying_question = question;
        self.publish("clarifying_question", &self.clarifying_question);
    }

    pub fn set_quality_gate_result(&mut self, result: Option<String>) {
        self.quality_gate_result = result;
        self.publish("quality_gate_result", &self.quality_gate_result);
    }

    pub fn set_documentation_result(&mut self, result: Option<String>) {
        self.documentation_result = result;
        self.publish("documentation_result", &self.documentation_result);
    }

    pub fn set_workspace(&mut self, workspace: Option<WorkspaceInfo>) {
        self.workspace = workspace;
        self.publish("workspace", &self.workspace);
    }

    pub fn start_cycle(&mut self) -> u32 {
        self.cycle += 1;
        self.publish("cycle", &self.cycle);
        self.cycle
    }

    /// Session id for a role, created on first use.
    pub fn session_for(&mut self, role: AgentRole) -> String {
        if let Some(session) = self.sessions.get(&role) {
            return session.id.clone();
        }
        let session = AgentSession {
            id: Uuid::new_v4().to_string(),
            calls: 0,
        };
        let id = session.id.clone();
        self.sessions.insert(role, session);
        self.publish("sessions", &self.sessions);
        id
    }

    pub fn record_session_call(&mut self, role: AgentRole) {
        if let Some(session) = self.sessions.get_mut(&role) {
            session.calls += 1;
            self.publish("sessions", &self.sessions);
        }
    }
}

/// Whether the work under review has been applied yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    /// A plan for the chunk; no files were touched.
    Proposal,
    /// Applied changes.
    Implementation,
}

/// Per-execution-cycle record, owned by the execution loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    chunk_files: Vec<String>,
    #[serde(default)]
    last_outputs: BTreeMap<AgentRole, String>,
    #[serde(default)]
    attempts: BTreeMap<AgentRole, u32>,
    #[serde(default)]
    completed_chunks: Vec<String>,
    #[serde(default)]
    review_feedback: Option<String>,
    #[serde(default)]
    approved_proposal: Option<String>,
    #[serde(default)]
    submission: Option<SubmissionKind>,
    #[serde(default)]
    files_changed: Vec<String>,
    #[serde(default)]
    needs_human: bool,
    #[serde(default)]
    human_context: Option<String>,
    #[serde(skip)]
    notifier: Notifier,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Notifier::default())
    }
}

impl ExecutionContext {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            chunk: None,
            chunk_files: Vec::new(),
            last_outputs: BTreeMap::new(),
            attempts: BTreeMap::new(),
            completed_chunks: Vec::new(),
            review_feedback: None,
            approved_proposal: None,
            submission: None,
            files_changed: Vec::new(),
            needs_human: false,
            human_context: None,
            notifier,
        }
    }

    pub fn attach_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn chunk(&self) -> Option<&str> {
        self.chunk.as_deref()
    }

    pub fn chunk_files(&self) -> &[String] {
        &self.chunk_files
    }

    pub fn last_output(&self, role: AgentRole) -> Option<&str> {
        self.last_outputs.get(&role).map(String::as_str)
    }

    pub fn attempts(&self, role: AgentRole) -> u32 {
        self.attempts.get(&role).copied().unwrap_or(0)
    }

    pub fn completed_chunks(&self) -> &[String] {
        &self.completed_chunks
    }

    pub fn review_feedback(&self) -> Option<&str> {
        self.review_feedback.as_deref()
    }

    pub fn approved_proposal(&self) -> Option<&str> {
        self.approved_proposal.as_deref()
    }

    pub fn submission(&self) -> Option<SubmissionKind> {
        self.submission
    }

    pub fn files_changed(&self) -> &[String] {
        &self.files_changed
    }

    pub fn needs_human(&self) -> bool {
        self.needs_human
    }

    pub fn human_context(&self) -> Option<&str> {
        self.human_context.as_deref()
    }

    /// Cumulative progress as a bulleted list, for the chunking agent.
    pub fn progress_summary(&self) -> String {
        self.completed_chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| format!("{}. {}", i + 1, first_line(chunk)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn publish<T: Serialize + ?Sized>(&self, field: &str, value: &T) {
        self.notifier.field(ContextScope::Execution, field, value);
    }

    /// Start a new chunk: per-chunk counters and review state reset.
    pub fn begin_chunk(&mut self, description: String, files: Vec<String>) {
        self.chunk = Some(description);
        self.chunk_files = files;
        self.attempts.clear();
        self.review_feedback = None;
        self.approved_proposal = None;
        self.submission = None;
        self.files_changed.clear();
        self.publish("chunk", &self.chunk);
    }

    pub fn record_output(&mut self, role: AgentRole, text: impl Into<String>) {
        self.last_outputs.insert(role, text.into());
        self.publish("last_outputs", &self.last_outputs);
    }

    pub fn increment_attempts(&mut self, role: AgentRole) -> u32 {
        let count = self.attempts.entry(role).or_insert(0);
        *count += 1;
        let count = *count;
        self.publish("attempts", &self.attempts);
        count
    }

    pub fn reset_attempts(&mut self) {
        self.attempts.clear();
        self.publish("attempts", &self.attempts);
    }

    pub fn set_review_feedback(&mut self, feedback: Option<String>) {
        self.review_feedback = feedback;
        self.publish("review_feedback", &self.review_feedback);
    }

    pub fn set_approved_proposal(&mut self, proposal: Option<String>) {
        self.approved_proposal = proposal;
        self.publish("approved_proposal", &self.approved_proposal);
    }

    pub fn set_submission(&mut self, submission: Option<SubmissionKind>) {
        self.submission = submission;
        self.publish("submission", &self.submission);
    }

    pub fn set_files_changed(&mut self, files: Vec<String>) {
        self.files_changed = files;
        self.publish("files_changed", &self.files_changed);
    }

    /// Move the current chunk into cumulative progress.
    pub fn complete_chunk(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.completed_chunks.push(chunk);
            self.publish("completed_chunks", &self.completed_chunks);
        }
    }

    pub fn flag_needs_human(&mut self, reason: impl Into<String>) {
        self.needs_human = true;
        self.human_context = Some(reason.into());
        self.publish("needs_human", &self.human_context);
    }

    pub fn clear_needs_human(&mut self) {
        self.needs_human = false;
        self.human_context = None;
        self.publish("needs_human", &self.human_context);
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemorySink;
    use std::sync::Arc;

    fn observed_task() -> (TaskContext, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut ctx = TaskContext::new("t-1", "Add caching");
        ctx.attach_notifier(Notifier::new("t-1").with_sink(sink.clone()));
        (ctx, sink)
    }

    #[test]
    fn each_setter_publishes_once() {
        let (mut ctx, sink) = observed_task();
        ctx.set_plan(Some("1. add cache".into()));
        ctx.set_critique_feedback(Some("too big".into()));
        assert_eq!(ctx.increment_simplification_attempts(), 1);
        assert_eq!(
            sink.fields(ContextScope::Task),
            vec!["plan", "critique_feedback", "simplification_attempts"]
        );
    }

    #[test]
    fn planning_objective_prefers_retry_feedback() {
        let (mut ctx, _) = observed_task();
        ctx.set_refined_task(Some("Add an LRU cache".into()));
        assert_eq!(ctx.planning_objective(), ("Add an LRU cache", None));

        ctx.set_retry_feedback(Some("add input validation".into()));
        assert_eq!(
            ctx.planning_objective(),
            ("add input validation", Some("Add an LRU cache"))
        );
    }

    #[test]
    fn sessions_are_stable_per_role() {
        let (mut ctx, _) = observed_task();
        let review = ctx.session_for(AgentRole::Review);
        let plan = ctx.session_for(AgentRole::Planning);
        assert_ne!(review, plan);
        assert_eq!(ctx.session_for(AgentRole::Review), review);

        ctx.record_session_call(AgentRole::Review);
        ctx.record_session_call(AgentRole::Review);
        assert_eq!(ctx.sessions()[&AgentRole::Review].calls, 2);
        assert_eq!(ctx.session_ids().len(), 2);
    }

    #[test]
    fn task_context_round_trips_without_notifier() {
        let (mut ctx, _) = observed_task();
        ctx.set_plan(Some("plan".into()));
        ctx.session_for(AgentRole::Chunking);
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(!json.contains("notifier"));
        let restored: TaskContext = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, ctx);
    }

    #[test]
    fn begin_chunk_resets_per_chunk_state() {
        let mut exec = ExecutionContext::default();
        exec.begin_chunk("first".into(), vec![]);
        exec.increment_attempts(AgentRole::Review);
        exec.set_review_feedback(Some("fix it".into()));
        exec.set_submission(Some(SubmissionKind::Proposal));

        exec.complete_chunk();
        exec.begin_chunk("second".into(), vec!["src/lib.rs".into()]);

        assert_eq!(exec.attempts(AgentRole::Review), 0);
        assert!(exec.review_feedback().is_none());
        assert!(exec.submission().is_none());
        assert_eq!(exec.completed_chunks(), ["first".to_string()]);
        assert_eq!(exec.chunk(), Some("second"));
    }

    #[test]
    fn needs_human_flag_carries_reason() {
        let sink = Arc::new(MemorySink::new());
        let mut exec = ExecutionContext::new(Notifier::new("t").with_sink(sink.clone()));
        exec.flag_needs_human("review attempts exhausted");
        assert!(exec.needs_human());
        assert_eq!(exec.human_context(), Some("review attempts exhausted"));
        exec.clear_needs_human();
        assert!(!exec.needs_human());
        assert_eq!(sink.fields(ContextScope::Execution), vec!["needs_human", "needs_human"]);
    }

    #[test]
    fn progress_summary_numbers_first_lines() {
        let mut exec = ExecutionContext::default();
        exec.begin_chunk("Add struct\nwith details".into(), vec![]);
        exec.complete_chunk();
        exec.begin_chunk("Wire it".into(), vec![]);
        exec.complete_chunk();
        assert_eq!(exec.progress_summary(), "1. Add struct\n2. Wire it");
    }
}
