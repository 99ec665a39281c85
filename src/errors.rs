//! Typed error hierarchy for the cadence orchestrator.
//!
//! One enum per subsystem, plus the umbrella `OrchestratorError`:
//! - `AgentError`: agent invocation transport failures
//! - `SandboxError`: isolated workspace failures
//! - `TransitionError`: an event raised against a state with no defined transition
//! - `CheckpointError`: persisting or reading checkpoint documents
//! - `RestorationError`: a persisted checkpoint failed validation
//!
//! Interpretation failures have no variant: the interpreter reports
//! them as `None` and the orchestrator turns a repeated `None` into an
//! escalation, never into an error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::agent::AgentRole;

/// Failures raised while invoking an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent process exited with code {exit_code}: {stderr}")]
    NonZeroExit { exit_code: i32, stderr: String },

    #[error("Agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent transport error: {0}")]
    Transport(String),

    #[error("Agent call cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether a retry at the calling transition may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// Failures raised by a sandbox implementation.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to prepare workspace for task {task_id}: {message}")]
    WorkspaceUnavailable { task_id: String, message: String },

    #[error("Commit in {path} failed: {message}")]
    CommitFailed { path: PathBuf, message: String },

    #[error("Merge of task {task_id} failed: {message}")]
    MergeFailed { task_id: String, message: String },

    #[error("Cleanup of task {task_id} failed: {message}")]
    CleanupFailed { task_id: String, message: String },
}

/// An event was raised against a state with no defined transition.
///
/// The transition tables are exhaustive, so this indicates a programming
/// error in the caller. It is surfaced immediately, never swallowed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{machine} machine has no transition from {state} on {event}")]
pub struct TransitionError {
    pub machine: &'static str,
    pub state: String,
    pub event: String,
}

impl TransitionError {
    pub fn new(machine: &'static str, state: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            machine,
            state: state.into(),
            event: event.into(),
        }
    }
}

/// Failures persisting or reading checkpoint documents.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("No checkpoint found for task {0}")]
    NotFound(String),

    #[error(
        "Refusing checkpoint {attempted} for task {task_id}: sequence {current} is already persisted"
    )]
    StaleSequence {
        task_id: String,
        attempted: u64,
        current: u64,
    },

    #[error("Checkpoint for task {0} is locked by another writer")]
    Locked(String),

    #[error("Invalid task id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidTaskId(String),

    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A persisted checkpoint failed structural validation.
///
/// Restoration aborts on any of these and leaves the checkpoint untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RestorationError {
    #[error("Checkpoint is not valid JSON: {0}")]
    Malformed(String),

    #[error("Checkpoint schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Checkpoint digest mismatch: recorded {recorded}, computed {computed}")]
    DigestMismatch { recorded: String, computed: String },

    #[error("Unknown {field} value '{value}'")]
    UnknownState { field: String, value: String },

    #[error("Counter {field} must be a non-negative integer, found {value}")]
    InvalidCounter { field: String, value: String },

    #[error("Checkpoint belongs to task {found}, expected {expected}")]
    TaskMismatch { expected: String, found: String },

    #[error("Inconsistent checkpoint: {0}")]
    Inconsistent(String),
}

/// Umbrella error for a task orchestration run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{role} agent failed after {attempts} attempt(s): {source}")]
    Agent {
        role: AgentRole,
        attempts: u32,
        #[source]
        source: AgentError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Restoration(#[from] RestorationError),

    #[error("Decision {decision} does not fit the pending {point} escalation")]
    InvalidDecision { point: String, decision: String },

    #[error("No decision is pending for task {0}")]
    NoPendingDecision(String),

    #[error("Task run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_machine_state_and_event() {
        let err = TransitionError::new("task phase", "complete", "planned");
        let msg = err.to_string();
        assert!(msg.contains("task phase"));
        assert!(msg.contains("complete"));
        assert!(msg.contains("planned"));
    }

    #[test]
    fn orchestrator_error_converts_from_transition_error() {
        let err: OrchestratorError = TransitionError::new("execution loop", "chunking", "proposed").into();
        match &err {
            OrchestratorError::Transition(inner) => assert_eq!(inner.machine, "execution loop"),
            _ => panic!("Expected Transition variant"),
        }
    }

    #[test]
    fn stale_sequence_carries_both_sequences() {
        let err = CheckpointError::StaleSequence {
            task_id: "t-1".into(),
            attempted: 3,
            current: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn cancelled_agent_error_is_not_retryable() {
        assert!(!AgentError::Cancelled.is_retryable());
        assert!(AgentError::Transport("reset".into()).is_retryable());
        assert!(AgentError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn agent_failure_reports_role_and_attempts() {
        let err = OrchestratorError::Agent {
            role: AgentRole::Review,
            attempts: 4,
            source: AgentError::Transport("connection reset".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("review"));
        assert!(msg.contains('4'));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AgentError::Cancelled);
        assert_std_error(&TransitionError::new("m", "s", "e"));
        assert_std_error(&RestorationError::Malformed("x".into()));
        assert_std_error(&CheckpointError::NotFound("t".into()));
        assert_std_error(&OrchestratorError::Cancelled);
    }
}
