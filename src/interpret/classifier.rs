//! Stage-one classification: reduce a raw response to a short keyword signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::agent::{AgentInvoker, AgentResponse, AgentRole, PromptContext, TokenUsage};
use crate::errors::AgentError;

/// Resources spent on classification calls since the last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassificationUsage {
    pub calls: u64,
    pub cost_usd: f64,
    pub token_usage: TokenUsage,
    pub duration: Duration,
}

impl ClassificationUsage {
    fn record(&mut self, response: &AgentResponse) {
        self.calls += 1;
        self.cost_usd += response.cost_usd;
        self.token_usage.input_tokens += response.token_usage.input_tokens;
        self.token_usage.output_tokens += response.token_usage.output_tokens;
        self.duration += response.duration;
    }
}

/// Produces the keyword signal for one response.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        role: AgentRole,
        vocabulary: &[&'static str],
        raw_text: &str,
    ) -> Result<String, AgentError>;

    /// Take and reset the accumulated usage.
    fn drain_usage(&self) -> ClassificationUsage {
        ClassificationUsage::default()
    }
}

/// Offline classifier: the raw response is its own signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(
        &self,
        _role: AgentRole,
        _vocabulary: &[&'static str],
        raw_text: &str,
    ) -> Result<String, AgentError> {
        Ok(raw_text.to_string())
    }
}

/// Asks a model, through the agent invoker, for a single keyword.
///
/// Every call uses a fresh session so classifications never share context.
pub struct ModelClassifier {
    invoker: Arc<dyn AgentInvoker>,
    usage: Mutex<ClassificationUsage>,
}

impl ModelClassifier {
    pub fn new(invoker: Arc<dyn AgentInvoker>) -> Self {
        Self {
            invoker,
            usage: Mutex::new(ClassificationUsage::default()),
        }
    }

    pub fn prompt(role: AgentRole, vocabulary: &[&'static str], raw_text: &str) -> PromptContext {
        PromptContext::new(
            AgentRole::Classifier,
            format!("Classify the following {} agent response.", role),
        )
        .with_section("Allowed keywords", vocabulary.join("\n"))
        .with_section(
            "Instructions",
            "Reply with exactly one keyword from the allowed list and nothing else. \
             If the response does not clearly match any keyword, reply with the first keyword.",
        )
        .with_section("Response", raw_text)
    }
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(
        &self,
        role: AgentRole,
        vocabulary: &[&'static str],
        raw_text: &str,
    ) -> Result<String, AgentError> {
        let prompt = Self::prompt(role, vocabulary, raw_text);
        let session_id = Uuid::new_v4().to_string();
        let response = self
            .invoker
            .invoke(AgentRole::Classifier, &prompt, &session_id)
            .await?;
        if let Ok(mut usage) = self.usage.lock() {
            usage.record(&response);
        }
        Ok(response.raw_text)
    }

    fn drain_usage(&self) -> ClassificationUsage {
        self.usage
            .lock()
            .map(|mut usage| std::mem::take(&mut *usage))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Records session ids and answers with a fixed signal.
    struct Recording {
        sessions: Mutex<Vec<String>>,
        answer: String,
    }

    #[async_trait]
    impl AgentInvoker for Recording {
        async fn invoke(
            &self,
            role: AgentRole,
            prompt: &PromptContext,
            session_id: &str,
        ) -> Result<AgentResponse, AgentError> {
            assert_eq!(role, AgentRole::Classifier);
            assert!(prompt.section("Response").is_some());
            self.sessions.lock().unwrap().push(session_id.to_string());
            Ok(AgentResponse {
                raw_text: self.answer.clone(),
                cost_usd: 0.01,
                duration: Duration::from_millis(5),
                token_usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 1,
                },
            })
        }
    }

    #[tokio::test]
    async fn keyword_classifier_echoes_raw_text() {
        let signal = KeywordClassifier
            .classify(AgentRole::Review, &["approve"], "approve it")
            .await
            .unwrap();
        assert_eq!(signal, "approve it");
        assert_eq!(KeywordClassifier.drain_usage(), ClassificationUsage::default());
    }

    #[tokio::test]
    async fn model_classifier_uses_fresh_sessions_and_tracks_usage() {
        let invoker = Arc::new(Recording {
            sessions: Mutex::new(Vec::new()),
            answer: "revise".to_string(),
        });
        let classifier = ModelClassifier::new(invoker.clone());

        for _ in 0..3 {
            let signal = classifier
                .classify(AgentRole::Review, &["needs_human", "revise"], "fix the tests")
                .await
                .unwrap();
            assert_eq!(signal, "revise");
        }

        let sessions = invoker.sessions.lock().unwrap().clone();
        assert_eq!(sessions.iter().collect::<HashSet<_>>().len(), 3);

        let usage = classifier.drain_usage();
        assert_eq!(usage.calls, 3);
        assert_eq!(usage.token_usage.input_tokens, 30);
        assert_eq!(classifier.drain_usage().calls, 0);
    }

    #[test]
    fn prompt_lists_vocabulary() {
        let prompt = ModelClassifier::prompt(AgentRole::QualityGate, &["needs_human", "approve"], "ok");
        assert_eq!(prompt.role, AgentRole::Classifier);
        assert_eq!(prompt.section("Allowed keywords"), Some("needs_human\napprove"));
        assert!(prompt.objective.contains("quality_gate"));
    }
}
