//! Agent invocation boundary.
//!
//! The orchestrator talks to every LLM-driven collaborator through the
//! [`AgentInvoker`] trait. Calls sharing a session id see continued
//! conversational context; everything else about the agent (model, prompt
//! templates, tool permissions) lives behind the trait.

mod claude;
mod retry;

pub use claude::ClaudeInvoker;
pub use retry::{RetryPolicy, invoke_with_retry};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// The role an agent plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Refinement,
    Planning,
    PlanCritique,
    Chunking,
    Implementation,
    Review,
    QualityGate,
    Documentation,
    /// Short classification calls issued by the response interpreter.
    Classifier,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refinement => "refinement",
            Self::Planning => "planning",
            Self::PlanCritique => "plan_critique",
            Self::Chunking => "chunking",
            Self::Implementation => "implementation",
            Self::Review => "review",
            Self::QualityGate => "quality_gate",
            Self::Documentation => "documentation",
            Self::Classifier => "classifier",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "refinement" => Ok(Self::Refinement),
            "planning" => Ok(Self::Planning),
            "plan_critique" => Ok(Self::PlanCritique),
            "chunking" => Ok(Self::Chunking),
            "implementation" => Ok(Self::Implementation),
            "review" => Ok(Self::Review),
            "quality_gate" => Ok(Self::QualityGate),
            "documentation" => Ok(Self::Documentation),
            "classifier" => Ok(Self::Classifier),
            _ => anyhow::bail!("Unknown agent role '{}'", s),
        }
    }
}

/// Structured input for one agent call.
///
/// Holds the objective plus ordered, named sections. Rendering is plain
/// markdown; role-specific instruction text is supplied by the caller as a
/// section, not baked in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub role: AgentRole,
    pub objective: String,
    #[serde(default)]
    pub sections: Vec<PromptSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSection {
    pub title: String,
    pub body: String,
}

impl PromptContext {
    pub fn new(role: AgentRole, objective: impl Into<String>) -> Self {
        Self {
            role,
            objective: objective.into(),
            sections: Vec::new(),
        }
    }

    /// Append a section. Empty bodies are dropped.
    pub fn with_section(mut self, title: impl Into<String>, body: impl Into<String>) -> Self {
        let body = body.into();
        if !body.trim().is_empty() {
            self.sections.push(PromptSection {
                title: title.into(),
                body,
            });
        }
        self
    }

    /// Append a section only when a value is present.
    pub fn with_optional_section(self, title: impl Into<String>, body: Option<&str>) -> Self {
        match body {
            Some(body) => self.with_section(title, body),
            None => self,
        }
    }

    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.title == title)
            .map(|s| s.body.as_str())
    }

    pub fn render(&self) -> String {
        let mut out = format!("# {} agent\n\n## OBJECTIVE\n{}\n", self.role, self.objective.trim());
        for section in &self.sections {
            out.push_str(&format!(
                "\n## {}\n{}\n",
                section.title.to_uppercase(),
                section.body.trim()
            ));
        }
        out
    }
}

/// Token accounting reported by the agent backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Everything an agent call returns.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub raw_text: String,
    pub cost_usd: f64,
    pub duration: Duration,
    pub token_usage: TokenUsage,
}

impl AgentResponse {
    /// Response carrying text only, with zero cost and usage.
    pub fn text(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            cost_usd: 0.0,
            duration: Duration::ZERO,
            token_usage: TokenUsage::default(),
        }
    }
}

/// Abstraction over agent execution for testability.
/// Real implementation: [`ClaudeInvoker`]. Tests use scripted doubles.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        role: AgentRole,
        prompt: &PromptContext,
        session_id: &str,
    ) -> Result<AgentResponse, AgentError>;

    /// Declare sessions that already hold conversational context, e.g. after
    /// restoring a checkpoint in a fresh process.
    fn resume_sessions(&self, _session_ids: &[String]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            AgentRole::Refinement,
            AgentRole::Planning,
            AgentRole::PlanCritique,
            AgentRole::Chunking,
            AgentRole::Implementation,
            AgentRole::Review,
            AgentRole::QualityGate,
            AgentRole::Documentation,
            AgentRole::Classifier,
        ] {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
        assert!("janitor".parse::<AgentRole>().is_err());
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&AgentRole::PlanCritique).unwrap();
        assert_eq!(json, "\"plan_critique\"");
    }

    #[test]
    fn prompt_drops_empty_sections() {
        let prompt = PromptContext::new(AgentRole::Planning, "Add a cache")
            .with_section("Feedback", "   ")
            .with_optional_section("Reference", None)
            .with_section("Plan", "1. do it");
        assert_eq!(prompt.sections.len(), 1);
        assert_eq!(prompt.section("Plan"), Some("1. do it"));
    }

    #[test]
    fn prompt_render_includes_objective_and_sections() {
        let rendered = PromptContext::new(AgentRole::Review, "Review the change")
            .with_section("Chunk", "Add validation")
            .render();
        assert!(rendered.starts_with("# review agent"));
        assert!(rendered.contains("## OBJECTIVE\nReview the change"));
        assert!(rendered.contains("## CHUNK\nAdd validation"));
    }

    #[test]
    fn token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 120,
            output_tokens: 30,
        };
        assert_eq!(usage.total(), 150);
    }
}
