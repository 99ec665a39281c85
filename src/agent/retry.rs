//! Bounded retry with exponential backoff around agent calls.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{AgentInvoker, AgentResponse, AgentRole, PromptContext};
use crate::config::AgentSettings;
use crate::errors::{AgentError, OrchestratorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self::new(
            settings.max_transport_retries,
            Duration::from_millis(settings.backoff_initial_ms),
            Duration::from_millis(settings.backoff_max_ms),
        )
    }

    /// No waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

/// Invoke an agent, retrying transport failures with backoff.
///
/// Cancellation is raced against both the call and the backoff sleep; a
/// cancelled run returns `OrchestratorError::Cancelled` immediately.
pub async fn invoke_with_retry(
    invoker: &dyn AgentInvoker,
    role: AgentRole,
    prompt: &PromptContext,
    session_id: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<AgentResponse, OrchestratorError> {
    let mut retries = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            result = invoker.invoke(role, prompt, session_id) => result,
        };

        match result {
            Ok(response) => return Ok(response),
            Err(AgentError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                let wait = policy.backoff(retries);
                warn!(
                    %role,
                    error = %err,
                    "agent call failed, retrying in {}ms (attempt {}/{})",
                    wait.as_millis(),
                    retries + 1,
                    policy.max_retries
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
                retries += 1;
            }
            Err(err) => {
                error!(%role, error = %err, "agent call failed after {} retries", retries);
                return Err(OrchestratorError::Agent {
                    role,
                    attempts: retries + 1,
                    source: err,
                });
            }
        }
    }
}
