//! Agent invoker backed by the Claude CLI's `stream-json` output.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AgentInvoker, AgentResponse, AgentRole, PromptContext, TokenUsage};
use crate::config::AgentSettings;
use crate::errors::AgentError;

/// Events from the CLI's stream-json output that matter here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        usage: Option<StreamUsage>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct StreamUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Folded result of one CLI run.
#[derive(Debug, Default, PartialEq)]
struct StreamOutcome {
    text: String,
    is_error: bool,
    cost_usd: f64,
    usage: TokenUsage,
}

/// Fold stream-json lines into a single outcome.
///
/// The final `result` event wins over accumulated assistant text. Lines that
/// are not JSON are kept as plain text.
fn fold_stream<'a>(lines: impl IntoIterator<Item = &'a str>) -> StreamOutcome {
    let mut accumulated = String::new();
    let mut outcome = StreamOutcome::default();
    let mut final_result: Option<String> = None;

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                for block in message.content {
                    if let ContentBlock::Text { text } = block {
                        accumulated.push_str(&text);
                        accumulated.push('\n');
                    }
                }
            }
            Ok(StreamEvent::Result {
                result,
                is_error,
                total_cost_usd,
                usage,
            }) => {
                final_result = result;
                outcome.is_error = is_error;
                outcome.cost_usd = total_cost_usd.unwrap_or(0.0);
                if let Some(usage) = usage {
                    outcome.usage = TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    };
                }
            }
            Ok(StreamEvent::Other) => {}
            Err(_) => {
                accumulated.push_str(line);
                accumulated.push('\n');
            }
        }
    }

    outcome.text = final_result.unwrap_or(accumulated);
    outcome
}

/// Runs agents through the Claude CLI.
///
/// The first call for a session id passes `--session-id`; later calls pass
/// `--resume` so the agent keeps its conversational context.
pub struct ClaudeInvoker {
    command: String,
    skip_permissions: bool,
    working_dir: PathBuf,
    timeout: Duration,
    started_sessions: Mutex<HashSet<String>>,
}

impl ClaudeInvoker {
    pub fn new(settings: &AgentSettings, working_dir: PathBuf) -> Self {
        Self {
            command: settings.command.clone(),
            skip_permissions: settings.skip_permissions,
            working_dir,
            timeout: Duration::from_secs(settings.timeout_secs),
            started_sessions: Mutex::new(HashSet::new()),
        }
    }

    fn is_started(&self, session_id: &str) -> bool {
        self.started_sessions
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(false)
    }

    fn mark_started(&self, session_id: &str) {
        if let Ok(mut set) = self.started_sessions.lock() {
            set.insert(session_id.to_string());
        }
    }

    fn args(&self, session_id: &str, resume: bool) -> Vec<String> {
        let mut args = Vec::new();
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("--print".to_string());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        if resume {
            args.push("--resume".to_string());
        } else {
            args.push("--session-id".to_string());
        }
        args.push(session_id.to_string());
        args
    }

    async fn run_process(&self, args: &[String], prompt: &str) -> Result<StreamOutcome, AgentError> {
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&self.working_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;

        // Prompt is written while stdout is drained.
        let stdin_task = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            tokio::spawn(async move {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|e| format!("writing prompt: {}", e))?;
                stdin
                    .shutdown()
                    .await
                    .map_err(|e| format!("closing stdin: {}", e))
            })
        });

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Transport("agent stdout unavailable".to_string()))?;
        let mut reader = BufReader::new(stdout).lines();
        let mut lines = Vec::new();
        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| AgentError::Transport(format!("reading agent output: {}", e)))?
        {
            lines.push(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AgentError::Transport(format!("waiting for agent: {}", e)))?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(AgentError::NonZeroExit {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        if let Some(task) = stdin_task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(AgentError::Transport(e)),
                Err(e) => return Err(AgentError::Transport(format!("prompt writer failed: {}", e))),
            }
        }

        let outcome = fold_stream(lines.iter().map(String::as_str));
        if outcome.is_error {
            return Err(AgentError::Transport(format!(
                "agent reported an error: {}",
                outcome.text.trim()
            )));
        }
        Ok(outcome)
    }
}

#[async_trait]
impl AgentInvoker for ClaudeInvoker {
    async fn invoke(
        &self,
        role: AgentRole,
        prompt: &PromptContext,
        session_id: &str,
    ) -> Result<AgentResponse, AgentError> {
        let rendered = prompt.render();
        let resume = self.is_started(session_id);
        let args = self.args(session_id, resume);
        debug!(
            %role,
            session_id,
            resume,
            prompt_chars = rendered.len(),
            "invoking {}",
            self.command
        );

        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.run_process(&args, &rendered)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(%role, session_id, "agent call timed out");
                return Err(AgentError::Timeout(self.timeout));
            }
        };
        self.mark_started(session_id);

        Ok(AgentResponse {
            raw_text: outcome.text,
            cost_usd: outcome.cost_usd,
            duration: start.elapsed(),
            token_usage: outcome.usage,
        })
    }

    fn resume_sessions(&self, session_ids: &[String]) {
        for id in session_ids {
            self.mark_started(id);
        }
    }
}
