//! Change notifications.
//!
//! Every committed mutation of a task's context or machine state produces
//! exactly one [`NotificationEnvelope`]. Publishers hold a [`Notifier`]; who
//! listens is decided by the sinks attached to it.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 1000;

/// Which record a field notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextScope {
    Task,
    Execution,
}

/// Which machine a state notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineKind {
    Phase,
    Execution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeNotification {
    FieldChanged {
        scope: ContextScope,
        field: String,
        value: serde_json::Value,
    },
    StateChanged {
        machine: MachineKind,
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub id: Uuid,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub notification: ChangeNotification,
}

impl NotificationEnvelope {
    pub fn new(task_id: impl Into<String>, notification: ChangeNotification) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            timestamp: Utc::now(),
            notification,
        }
    }
}

/// Receives published notifications.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, envelope: &NotificationEnvelope);
}

/// Fans notifications out to `tokio` broadcast subscribers.
#[derive(Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<NotificationEnvelope>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Events published before subscribing are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(&self, envelope: &NotificationEnvelope) {
        // No subscribers is not an error.
        let _ = self.sender.send(envelope.clone());
    }
}

/// Writes each notification to the `tracing` log at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(&self, envelope: &NotificationEnvelope) {
        match &envelope.notification {
            ChangeNotification::FieldChanged {
                scope,
                field,
                value,
            } => debug!(task_id = %envelope.task_id, ?scope, field = %field, %value, "context changed"),
            ChangeNotification::StateChanged { machine, from, to } => {
                debug!(task_id = %envelope.task_id, ?machine, from = %from, to = %to, "state changed")
            }
        }
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    received: Mutex<Vec<NotificationEnvelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<NotificationEnvelope> {
        self.received
            .lock()
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    /// Field names published for a scope, in order.
    pub fn fields(&self, scope: ContextScope) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|env| match env.notification {
                ChangeNotification::FieldChanged { scope: s, field, .. } if s == scope => Some(field),
                _ => None,
            })
            .collect()
    }

    /// `(from, to)` pairs published for a machine, in order.
    pub fn transitions(&self, machine: MachineKind) -> Vec<(String, String)> {
        self.snapshot()
            .into_iter()
            .filter_map(|env| match env.notification {
                ChangeNotification::StateChanged { machine: m, from, to } if m == machine => {
                    Some((from, to))
                }
                _ => None,
            })
            .collect()
    }
}

impl NotificationSink for MemorySink {
    fn publish(&self, envelope: &NotificationEnvelope) {
        if let Ok(mut items) = self.received.lock() {
            items.push(envelope.clone());
        }
    }
}

/// Publishing handle held by contexts and machines.
///
/// Cloning shares the attached sinks. A notifier with no sinks drops
/// everything, which is what a freshly deserialized context carries until
/// the orchestrator attaches the live one.
#[derive(Clone, Default)]
pub struct Notifier {
    task_id: String,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn publish(&self, notification: ChangeNotification) {
        if self.sinks.is_empty() {
            return;
        }
        let envelope = NotificationEnvelope::new(self.task_id.clone(), notification);
        for sink in &self.sinks {
            sink.publish(&envelope);
        }
    }

    pub fn field<T: Serialize + ?Sized>(&self, scope: ContextScope, field: &str, value: &T) {
        if self.sinks.is_empty() {
            return;
        }
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.publish(ChangeNotification::FieldChanged {
            scope,
            field: field.to_string(),
            value,
        });
    }

    pub fn state(&self, machine: MachineKind, from: impl fmt::Display, to: impl fmt::Display) {
        self.publish(ChangeNotification::StateChanged {
            machine,
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("task_id", &self.task_id)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Notifiers never participate in context equality.
impl PartialEq for Notifier {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}
