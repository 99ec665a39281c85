//! Restoration: validate a persisted checkpoint, then rebuild both machines.
//!
//! Validation runs on the untyped JSON first so every failure names the
//! offending field. Nothing is rebuilt until the whole document passes, and
//! the document itself is never modified.

use serde_json::Value;

use super::{CURRENT_SCHEMA_VERSION, Checkpoint, ProgressCounters, body_digest};
use crate::errors::RestorationError;
use crate::human::DecisionPoint;
use crate::machine::{ExecutionLoopMachine, ExecutionState, TaskPhase, TaskPhaseMachine};
use crate::notify::Notifier;

/// A fully rebuilt task, ready to be driven again.
#[derive(Debug)]
pub struct RestoredTask {
    pub machine: TaskPhaseMachine,
    pub progress: ProgressCounters,
    pub sequence: u64,
}

/// Validate and rebuild a checkpoint document.
///
/// `expected_task_id` guards against restoring the wrong file.
pub fn restore(
    raw: &str,
    expected_task_id: Option<&str>,
    notifier: Notifier,
) -> Result<RestoredTask, RestorationError> {
    let document: Value = serde_json::from_str(raw).map_err(|e| RestorationError::Malformed(e.to_string()))?;
    validate(&document, expected_task_id)?;

    let checkpoint: Checkpoint =
        serde_json::from_value(document).map_err(|e| RestorationError::Malformed(e.to_string()))?;
    let body = checkpoint.body;

    let execution = body
        .execution
        .map(|exec| ExecutionLoopMachine::restore(exec.state(), exec.context().clone(), notifier.clone()));
    let machine = TaskPhaseMachine::restore(
        body.phase,
        body.task_context,
        body.pending_decision,
        execution,
        notifier,
    );

    Ok(RestoredTask {
        machine,
        progress: body.progress,
        sequence: checkpoint.sequence,
    })
}

/// Structural checks on an untyped checkpoint document.
pub fn validate(document: &Value, expected_task_id: Option<&str>) -> Result<(), RestorationError> {
    let schema = counter(document, "schema_version")?;
    if schema > u64::from(CURRENT_SCHEMA_VERSION) {
        return Err(RestorationError::UnsupportedSchema {
            found: u32::try_from(schema).unwrap_or(u32::MAX),
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    counter(document, "sequence")?;

    let body = document
        .get("body")
        .filter(|b| b.is_object())
        .ok_or_else(|| RestorationError::Malformed("missing body object".to_string()))?;

    let recorded = document
        .get("digest")
        .and_then(Value::as_str)
        .ok_or_else(|| RestorationError::Malformed("missing digest".to_string()))?;
    let computed = body_digest(body).map_err(|e| RestorationError::Malformed(e.to_string()))?;
    if recorded != computed {
        return Err(RestorationError::DigestMismatch {
            recorded: recorded.to_string(),
            computed,
        });
    }

    let task_id = string_field(body, "task_id")?;
    if let Some(expected) = expected_task_id
        && expected != task_id
    {
        return Err(RestorationError::TaskMismatch {
            expected: expected.to_string(),
            found: task_id.to_string(),
        });
    }
    let context = body
        .get("task_context")
        .filter(|c| c.is_object())
        .ok_or_else(|| RestorationError::Malformed("missing task_context".to_string()))?;
    let context_task = string_field(context, "task_id")?;
    if context_task != task_id {
        return Err(RestorationError::Inconsistent(format!(
            "task context belongs to {} but checkpoint is for {}",
            context_task, task_id
        )));
    }

    let phase_name = string_field(body, "phase")?;
    let phase: TaskPhase = phase_name.parse().map_err(|_| RestorationError::UnknownState {
        field: "phase".to_string(),
        value: phase_name.to_string(),
    })?;

    optional_counter(context, "simplification_attempts")?;
    optional_counter(context, "cycle")?;
    if let Some(sessions) = context.get("sessions").and_then(Value::as_object) {
        for (role, session) in sessions {
            optional_counter(session, "calls").map_err(|e| rename_counter(e, &format!("sessions.{}.calls", role)))?;
        }
    }
    if let Some(progress) = body.get("progress").filter(|p| !p.is_null()) {
        validate_progress(progress)?;
    }

    let execution = body.get("execution").filter(|e| !e.is_null());
    let needs_human = match (phase, execution) {
        (TaskPhase::Executing, None) => {
            return Err(RestorationError::Inconsistent(
                "phase is executing but no execution snapshot is present".to_string(),
            ));
        }
        (TaskPhase::Executing, Some(execution)) => validate_execution(execution)?,
        (other, Some(_)) => {
            return Err(RestorationError::Inconsistent(format!(
                "execution snapshot present while phase is {}",
                other
            )));
        }
        (_, None) => false,
    };

    let pending_point = match body.get("pending_decision").filter(|p| !p.is_null()) {
        Some(pending) => {
            let name = string_field(pending, "point")?;
            let point: DecisionPoint = name.parse().map_err(|_| RestorationError::UnknownState {
                field: "pending_decision.point".to_string(),
                value: name.to_string(),
            })?;
            if phase.decision_point() != Some(point) {
                return Err(RestorationError::Inconsistent(format!(
                    "pending {} decision cannot be awaited in phase {}",
                    point, phase
                )));
            }
            Some(point)
        }
        None => None,
    };

    let awaiting_execution = pending_point == Some(DecisionPoint::Execution);
    if needs_human != awaiting_execution {
        return Err(RestorationError::Inconsistent(if needs_human {
            "execution loop needs a human but no execution decision is pending".to_string()
        } else {
            "execution decision is pending but the loop is not flagged".to_string()
        }));
    }

    Ok(())
}

/// Returns the loop's `needs_human` flag.
fn validate_execution(execution: &Value) -> Result<bool, RestorationError> {
    let state = string_field(execution, "state")?;
    state
        .parse::<ExecutionState>()
        .map_err(|_| RestorationError::UnknownState {
            field: "execution.state".to_string(),
            value: state.to_string(),
        })?;

    let context = execution
        .get("context")
        .filter(|c| c.is_object())
        .ok_or_else(|| RestorationError::Malformed("missing execution.context".to_string()))?;
    if let Some(attempts) = context.get("attempts").and_then(Value::as_object) {
        for (role, value) in attempts {
            if value.as_u64().is_none() {
                return Err(RestorationError::InvalidCounter {
                    field: format!("execution.attempts.{}", role),
                    value: value.to_string(),
                });
            }
        }
    }

    match context.get("needs_human") {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(RestorationError::Malformed(format!(
            "execution.needs_human must be a boolean, found {}",
            other
        ))),
    }
}

fn validate_progress(progress: &Value) -> Result<(), RestorationError> {
    for field in [
        "agent_calls",
        "classification_calls",
        "input_tokens",
        "output_tokens",
        "agent_time_ms",
        "chunks_completed",
        "execution_cycles",
    ] {
        optional_counter(progress, field).map_err(|e| rename_counter(e, &format!("progress.{}", field)))?;
    }
    if let Some(cost) = progress.get("cost_usd")
        && !cost.as_f64().is_some_and(|c| c >= 0.0)
    {
        return Err(RestorationError::InvalidCounter {
            field: "progress.cost_usd".to_string(),
            value: cost.to_string(),
        });
    }
    Ok(())
}

fn counter(value: &Value, field: &str) -> Result<u64, RestorationError> {
    match value.get(field) {
        None => Err(RestorationError::Malformed(format!("missing {}", field))),
        Some(v) => v.as_u64().ok_or_else(|| RestorationError::InvalidCounter {
            field: field.to_string(),
            value: v.to_string(),
        }),
    }
}

fn optional_counter(value: &Value, field: &str) -> Result<(), RestorationError> {
    match value.get(field) {
        None | Some(Value::Null) => Ok(()),
        Some(_) => counter(value, field).map(|_| ()),
    }
}

fn rename_counter(err: RestorationError, field: &str) -> RestorationError {
    match err {
        RestorationError::InvalidCounter { value, .. } => RestorationError::InvalidCounter {
            field: field.to_string(),
            value,
        },
        other => other,
    }
}

fn string_field<'a>(value: &'a Value, field: &str) -> Result<&'a str, RestorationError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RestorationError::Malformed(format!("missing {}", field)))
}
