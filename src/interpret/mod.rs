//! Response Interpreter.
//!
//! Turns one agent's free-text output into a typed decision in two stages:
//!
//! 1. A classifier reduces the text to a short keyword signal, matched
//!    against the role's ordered vocabulary ([`verdict`]).
//! 2. Heuristics scrape supplementary fields from the *original* text
//!    ([`extract`]).
//!
//! The interpreter keeps no state between calls. It never errors: a failed
//! or empty classification yields `None`, which callers retry once and then
//! escalate.

mod classifier;
mod decision;
pub mod extract;
mod strict;
pub mod verdict;

pub use classifier::{Classifier, ClassificationUsage, KeywordClassifier, ModelClassifier};
pub use decision::{
    ChunkDecision, CritiqueDecision, ImplementationDecision, Interpretation, QualityGateDecision,
    RefinementDecision, ReviewDecision,
};
pub use verdict::{
    ChunkVerdict, CritiqueVerdict, ImplementationVerdict, QualityGateVerdict, RefinementVerdict,
    ReviewVerdict, Verdict,
};

use std::sync::Arc;

use tracing::debug;

use crate::agent::{AgentInvoker, AgentRole};
use crate::config::{ClassifierKind, InterpretationMode, InterpreterSettings};
use extract::Extracted;

/// Verdict plus scraped fields, before shaping into a role decision.
struct Reading<V> {
    verdict: V,
    fields: Extracted,
    /// Raw text minus lines that only carry a vocabulary keyword.
    body: String,
}

pub struct ResponseInterpreter {
    classifier: Arc<dyn Classifier>,
    mode: InterpretationMode,
    min_description_len: usize,
}

impl ResponseInterpreter {
    pub fn new(classifier: Arc<dyn Classifier>, settings: &InterpreterSettings) -> Self {
        Self {
            classifier,
            mode: settings.mode,
            min_description_len: settings.min_description_len,
        }
    }

    /// Pick the classifier named in the settings.
    pub fn from_settings(settings: &InterpreterSettings, invoker: Arc<dyn AgentInvoker>) -> Self {
        let classifier: Arc<dyn Classifier> = match settings.classifier {
            ClassifierKind::Model => Arc::new(ModelClassifier::new(invoker)),
            ClassifierKind::Keyword => Arc::new(KeywordClassifier),
        };
        Self::new(classifier, settings)
    }

    /// Offline interpreter with default settings.
    pub fn keyword() -> Self {
        Self::new(Arc::new(KeywordClassifier), &InterpreterSettings::default())
    }

    pub fn mode(&self) -> InterpretationMode {
        self.mode
    }

    pub fn drain_usage(&self) -> ClassificationUsage {
        self.classifier.drain_usage()
    }

    /// Interpret a response for any role that yields a decision.
    ///
    /// Planning and documentation output is consumed verbatim, so those roles
    /// (and the classifier role itself) always return `None`.
    pub async fn interpret(&self, role: AgentRole, raw_text: &str) -> Option<Interpretation> {
        match role {
            AgentRole::Refinement => self.refinement(raw_text).await.map(Interpretation::Refinement),
            AgentRole::PlanCritique => self.critique(raw_text).await.map(Interpretation::PlanCritique),
            AgentRole::Chunking => self.chunk(raw_text).await.map(Interpretation::Chunking),
            AgentRole::Implementation => self
                .implementation(raw_text)
                .await
                .map(Interpretation::Implementation),
            AgentRole::Review => self.review(raw_text).await.map(Interpretation::Review),
            AgentRole::QualityGate => self.quality_gate(raw_text).await.map(Interpretation::QualityGate),
            AgentRole::Planning | AgentRole::Documentation | AgentRole::Classifier => None,
        }
    }

    pub async fn refinement(&self, raw_text: &str) -> Option<RefinementDecision> {
        let reading = self.read::<RefinementVerdict>(AgentRole::Refinement, raw_text).await?;
        let refined_task = (reading.verdict == RefinementVerdict::Refined)
            .then(|| reading.body.clone())
            .filter(|body| !body.is_empty());
        let question = (reading.verdict == RefinementVerdict::NeedsClarification)
            .then(|| reading.fields.question.clone())
            .flatten();
        Some(RefinementDecision {
            verdict: reading.verdict,
            refined_task,
            question,
        })
    }

    pub async fn critique(&self, raw_text: &str) -> Option<CritiqueDecision> {
        let reading = self.read::<CritiqueVerdict>(AgentRole::PlanCritique, raw_text).await?;
        Some(CritiqueDecision {
            verdict: reading.verdict,
            summary: reading.fields.description,
            issues: reading.fields.issues,
            feedback: reading.body,
        })
    }

    pub async fn chunk(&self, raw_text: &str) -> Option<ChunkDecision> {
        let reading = self.read::<ChunkVerdict>(AgentRole::Chunking, raw_text).await?;
        Some(ChunkDecision {
            verdict: reading.verdict,
            description: reading.fields.description,
            requirements: reading.fields.steps,
            files: reading.fields.files,
            context: reading.body,
        })
    }

    pub async fn implementation(&self, raw_text: &str) -> Option<ImplementationDecision> {
        let reading = self
            .read::<ImplementationVerdict>(AgentRole::Implementation, raw_text)
            .await?;
        Some(ImplementationDecision {
            verdict: reading.verdict,
            summary: reading.fields.description,
            files_changed: reading.fields.files,
            steps: reading.fields.steps,
        })
    }

    pub async fn review(&self, raw_text: &str) -> Option<ReviewDecision> {
        let reading = self.read::<ReviewVerdict>(AgentRole::Review, raw_text).await?;
        Some(ReviewDecision {
            verdict: reading.verdict,
            summary: reading.fields.description,
            issues: reading.fields.issues,
            feedback: reading.body,
        })
    }

    pub async fn quality_gate(&self, raw_text: &str) -> Option<QualityGateDecision> {
        let reading = self
            .read::<QualityGateVerdict>(AgentRole::QualityGate, raw_text)
            .await?;
        Some(QualityGateDecision {
            verdict: reading.verdict,
            summary: reading.fields.description,
            issues: reading.fields.issues,
            feedback: reading.body,
        })
    }

    async fn read<V: Verdict>(&self, role: AgentRole, raw_text: &str) -> Option<Reading<V>> {
        if !raw_text.chars().any(char::is_alphanumeric) {
            debug!(%role, "response has no readable content");
            return None;
        }
        match self.mode {
            InterpretationMode::NaturalLanguage => self.read_natural::<V>(role, raw_text).await,
            InterpretationMode::StrictSchema => self.read_strict::<V>(role, raw_text),
        }
    }

    async fn read_natural<V: Verdict>(&self, role: AgentRole, raw_text: &str) -> Option<Reading<V>> {
        let signal = match self.classifier.classify(role, &V::keywords(), raw_text).await {
            Ok(signal) => signal,
            Err(e) => {
                debug!(%role, error = %e, "classification call failed");
                return None;
            }
        };
        if signal.trim().is_empty() {
            debug!(%role, "classification returned an empty signal");
            return None;
        }

        let verdict = V::match_signal(&signal).unwrap_or_else(|| {
            debug!(
                %role,
                default = V::SAFE_DEFAULT.keyword(),
                "no verdict keyword in signal, using safe default"
            );
            V::SAFE_DEFAULT
        });

        Some(Reading {
            verdict,
            fields: Extracted::from_text(raw_text, self.min_description_len),
            body: strip_signal_lines::<V>(raw_text),
        })
    }

    fn read_strict<V: Verdict>(&self, role: AgentRole, raw_text: &str) -> Option<Reading<V>> {
        let Some(parsed) = strict::parse(raw_text) else {
            debug!(%role, "no verdict object in strict-schema response");
            return None;
        };
        let Some(verdict) = V::from_exact(&parsed.verdict) else {
            debug!(%role, verdict = %parsed.verdict, "verdict outside vocabulary");
            return None;
        };

        let heuristic = Extracted::from_text(raw_text, self.min_description_len);
        let fields = Extracted {
            description: parsed.description.or(heuristic.description),
            files: non_empty_or(parsed.files, heuristic.files),
            steps: non_empty_or(parsed.steps, heuristic.steps),
            question: parsed.question.or(heuristic.question),
            issues: non_empty_or(parsed.issues, heuristic.issues),
        };
        let body = fields
            .description
            .clone()
            .unwrap_or_else(|| strip_signal_lines::<V>(raw_text));

        Some(Reading {
            verdict,
            fields,
            body,
        })
    }
}

fn non_empty_or(primary: Vec<String>, fallback: Vec<String>) -> Vec<String> {
    if primary.is_empty() { fallback } else { primary }
}

/// Drop lines whose only content is a vocabulary keyword.
fn strip_signal_lines<V: Verdict>(raw_text: &str) -> String {
    let keywords = V::keywords();
    raw_text
        .lines()
        .filter(|line| {
            let bare = line
                .trim()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '_')
                .to_lowercase()
                .replace('-', "_");
            !keywords.contains(&bare.as_str())
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
