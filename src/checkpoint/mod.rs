//! Checkpoints: versioned, digest-protected snapshots of a whole task.
//!
//! One pretty-printed JSON document per task:
//!
//! ```json
//! {
//!   "schema_version": 1,
//!   "sequence": 12,
//!   "timestamp": "2026-03-01T10:00:00Z",
//!   "digest": "<sha256 of body>",
//!   "body": {
//!     "task_id": "...",
//!     "phase": "executing",
//!     "pending_decision": null,
//!     "task_context": { ... },
//!     "execution": { "state": "reviewing", "context": { ... } },
//!     "progress": { ... }
//!   }
//! }
//! ```
//!
//! Both machines are always written together in one document.

mod restore;
mod store;

pub use restore::{RestoredTask, restore, validate};
pub use store::{CheckpointStore, CheckpointSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent::AgentResponse;
use crate::context::TaskContext;
use crate::errors::CheckpointError;
use crate::human::PendingDecision;
use crate::interpret::ClassificationUsage;
use crate::machine::{ExecutionLoopMachine, TaskPhase, TaskPhaseMachine};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Running totals for a task, carried across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressCounters {
    #[serde(default)]
    pub agent_calls: u64,
    #[serde(default)]
    pub classification_calls: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub agent_time_ms: u64,
    #[serde(default)]
    pub chunks_completed: u64,
    #[serde(default)]
    pub execution_cycles: u64,
}

impl ProgressCounters {
    pub fn record_agent(&mut self, response: &AgentResponse) {
        self.agent_calls += 1;
        self.cost_usd += response.cost_usd;
        self.input_tokens += response.token_usage.input_tokens;
        self.output_tokens += response.token_usage.output_tokens;
        self.agent_time_ms += response.duration.as_millis() as u64;
    }

    pub fn record_classification(&mut self, usage: &ClassificationUsage) {
        self.classification_calls += usage.calls;
        self.cost_usd += usage.cost_usd;
        self.input_tokens += usage.token_usage.input_tokens;
        self.output_tokens += usage.token_usage.output_tokens;
        self.agent_time_ms += usage.duration.as_millis() as u64;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointBody {
    pub task_id: String,
    pub phase: TaskPhase,
    #[serde(default)]
    pub pending_decision: Option<PendingDecision>,
    pub task_context: TaskContext,
    #[serde(default)]
    pub execution: Option<ExecutionLoopMachine>,
    #[serde(default)]
    pub progress: ProgressCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub digest: String,
    pub body: CheckpointBody,
}

impl Checkpoint {
    /// Snapshot a machine at rest.
    pub fn capture(
        machine: &TaskPhaseMachine,
        progress: &ProgressCounters,
        sequence: u64,
    ) -> Result<Self, CheckpointError> {
        let body = CheckpointBody {
            task_id: machine.task_id().to_string(),
            phase: machine.phase(),
            pending_decision: machine.pending().cloned(),
            task_context: machine.context().clone(),
            execution: machine.execution().cloned(),
            progress: progress.clone(),
        };
        // Digest the body as it reads back from disk, not the in-memory value.
        let written = serde_json::to_string(&body)?;
        let digest = body_digest(&serde_json::from_str::<serde_json::Value>(&written)?)?;
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            sequence,
            timestamp: Utc::now(),
            digest,
            body,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.body.task_id
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// SHA-256 over the canonical (key-sorted) serialization of a body value.
pub fn body_digest(body: &serde_json::Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&sort_keys(body))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
