//! Typed per-role decisions produced by the interpreter.

use serde::{Deserialize, Serialize};

use super::verdict::{
    ChunkVerdict, CritiqueVerdict, ImplementationVerdict, QualityGateVerdict, RefinementVerdict,
    ReviewVerdict,
};
use crate::agent::AgentRole;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementDecision {
    pub verdict: RefinementVerdict,
    /// The rewritten task, present when the verdict is `refined`.
    pub refined_task: Option<String>,
    /// Present when the verdict is `needs_clarification`.
    pub question: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CritiqueDecision {
    pub verdict: CritiqueVerdict,
    pub summary: Option<String>,
    pub issues: Vec<String>,
    /// Response text without its verdict line, handed back to planning.
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDecision {
    pub verdict: ChunkVerdict,
    pub description: Option<String>,
    pub requirements: Vec<String>,
    pub files: Vec<String>,
    pub context: String,
}

impl ChunkDecision {
    pub fn is_task_complete(&self) -> bool {
        self.verdict == ChunkVerdict::TaskComplete
    }

    /// Description for the next chunk, falling back to the full context.
    pub fn chunk_text(&self) -> String {
        let mut text = self
            .description
            .clone()
            .unwrap_or_else(|| self.context.clone());
        if !self.requirements.is_empty() {
            text.push_str("\n\nRequirements:\n");
            for req in &self.requirements {
                text.push_str(&format!("- {}\n", req));
            }
        }
        text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplementationDecision {
    pub verdict: ImplementationVerdict,
    pub summary: Option<String>,
    pub files_changed: Vec<String>,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub verdict: ReviewVerdict,
    pub summary: Option<String>,
    pub issues: Vec<String>,
    pub feedback: String,
}

impl ReviewDecision {
    pub fn is_approval(&self) -> bool {
        matches!(
            self.verdict,
            ReviewVerdict::ApproveContinue
                | ReviewVerdict::ApproveComplete
                | ReviewVerdict::AlreadyComplete
        )
    }

    /// Approved, with more chunks to come.
    pub fn should_continue(&self) -> bool {
        self.verdict == ReviewVerdict::ApproveContinue
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.verdict,
            ReviewVerdict::ApproveComplete | ReviewVerdict::AlreadyComplete
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateDecision {
    pub verdict: QualityGateVerdict,
    pub summary: Option<String>,
    pub issues: Vec<String>,
    pub feedback: String,
}

impl QualityGateDecision {
    pub fn is_approved(&self) -> bool {
        self.verdict == QualityGateVerdict::Approve
    }
}

/// One interpreted response, tagged by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Interpretation {
    Refinement(RefinementDecision),
    PlanCritique(CritiqueDecision),
    Chunking(ChunkDecision),
    Implementation(ImplementationDecision),
    Review(ReviewDecision),
    QualityGate(QualityGateDecision),
}

impl Interpretation {
    pub fn role(&self) -> AgentRole {
        match self {
            Self::Refinement(_) => AgentRole::Refinement,
            Self::PlanCritique(_) => AgentRole::PlanCritique,
            Self::Chunking(_) => AgentRole::Chunking,
            Self::Implementation(_) => AgentRole::Implementation,
            Self::Review(_) => AgentRole::Review,
            Self::QualityGate(_) => AgentRole::QualityGate,
        }
    }

    /// The verdict keyword, for logging.
    pub fn verdict_keyword(&self) -> &'static str {
        use super::verdict::Verdict;
        match self {
            Self::Refinement(d) => d.verdict.keyword(),
            Self::PlanCritique(d) => d.verdict.keyword(),
            Self::Chunking(d) => d.verdict.keyword(),
            Self::Implementation(d) => d.verdict.keyword(),
            Self::Review(d) => d.verdict.keyword(),
            Self::QualityGate(d) => d.verdict.keyword(),
        }
    }
}
