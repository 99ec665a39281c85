//! Closed verdict vocabularies, one per agent role.
//!
//! Each vocabulary is ordered with the most conservative keyword first and
//! matched by case-insensitive substring, first match wins. A signal that
//! contains no keyword resolves to the role's safe default.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A role's verdict enumeration.
pub trait Verdict: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every verdict in match order.
    const VOCABULARY: &'static [Self];
    /// What an unrecognised signal means for this role.
    const SAFE_DEFAULT: Self;

    fn keyword(self) -> &'static str;

    /// First vocabulary keyword contained in `signal`, if any.
    fn match_signal(signal: &str) -> Option<Self> {
        let normalized = normalize(signal);
        Self::VOCABULARY
            .iter()
            .copied()
            .find(|v| normalized.contains(v.keyword()))
    }

    /// Keyword match with the safe default as fallback.
    fn from_signal(signal: &str) -> Self {
        Self::match_signal(signal).unwrap_or(Self::SAFE_DEFAULT)
    }

    /// Whole-string match, used by strict-schema responses.
    fn from_exact(keyword: &str) -> Option<Self> {
        let normalized = normalize(keyword.trim());
        Self::VOCABULARY
            .iter()
            .copied()
            .find(|v| v.keyword() == normalized)
    }

    fn keywords() -> Vec<&'static str> {
        Self::VOCABULARY.iter().map(|v| v.keyword()).collect()
    }
}

/// Lowercase and treat `-` as `_`, so `TASK-COMPLETE` reads as `task_complete`.
fn normalize(signal: &str) -> String {
    signal.to_lowercase().replace('-', "_")
}

macro_rules! verdict_enum {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident {
            $($variant:ident => $keyword:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl Verdict for $name {
            const VOCABULARY: &'static [Self] = &[$(Self::$variant),+];
            const SAFE_DEFAULT: Self = Self::$default;

            fn keyword(self) -> &'static str {
                match self {
                    $(Self::$variant => $keyword),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.keyword())
            }
        }
    };
}

verdict_enum! {
    /// Refinement agent: did the task text change?
    RefinementVerdict, default = Unchanged {
        NeedsClarification => "needs_clarification",
        Unchanged => "unchanged",
        Refined => "refined",
    }
}

verdict_enum! {
    /// Plan-critique agent.
    CritiqueVerdict, default = NeedsHuman {
        NeedsHuman => "needs_human",
        Reject => "reject",
        Simplify => "simplify",
        Approve => "approve",
    }
}

verdict_enum! {
    /// Chunking agent. The default keeps work going.
    ChunkVerdict, default = WorkChunk {
        TaskComplete => "task_complete",
        WorkChunk => "work_chunk",
    }
}

verdict_enum! {
    ImplementationVerdict, default = Continue {
        Propose => "propose",
        Implemented => "implemented",
        Continue => "continue",
    }
}

verdict_enum! {
    /// Review agent.
    ReviewVerdict, default = NeedsHuman {
        NeedsHuman => "needs_human",
        Reject => "reject",
        Revise => "revise",
        AlreadyComplete => "already_complete",
        ApproveComplete => "approve_complete",
        ApproveContinue => "approve_continue",
    }
}

verdict_enum! {
    /// Final quality gate. Anything short of an explicit approval escalates.
    QualityGateVerdict, default = NeedsHuman {
        NeedsHuman => "needs_human",
        Approve => "approve",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_matches_embedded_keyword() {
        let text = "Looks solid overall. approve_continue, moving to the next chunk.";
        assert_eq!(ReviewVerdict::from_signal(text), ReviewVerdict::ApproveContinue);
    }

    #[test]
    fn match_is_case_insensitive_and_dash_tolerant() {
        assert_eq!(
            ChunkVerdict::from_signal("TASK_COMPLETE — all requirements satisfied."),
            ChunkVerdict::TaskComplete
        );
        assert_eq!(
            ChunkVerdict::from_signal("Task-Complete"),
            ChunkVerdict::TaskComplete
        );
    }

    #[test]
    fn conservative_keyword_wins_when_several_appear() {
        assert_eq!(
            ReviewVerdict::from_signal("approve_continue but this needs_human sign-off"),
            ReviewVerdict::NeedsHuman
        );
        assert_eq!(
            CritiqueVerdict::from_signal("approve after we simplify"),
            CritiqueVerdict::Simplify
        );
    }

    #[test]
    fn no_keyword_yields_safe_default() {
        let text = "I have some thoughts but nothing conclusive.";
        assert_eq!(ReviewVerdict::from_signal(text), ReviewVerdict::NeedsHuman);
        assert_eq!(QualityGateVerdict::from_signal(text), QualityGateVerdict::NeedsHuman);
        assert_eq!(CritiqueVerdict::from_signal(text), CritiqueVerdict::NeedsHuman);
        assert_eq!(ChunkVerdict::from_signal(text), ChunkVerdict::WorkChunk);
        assert_eq!(ImplementationVerdict::from_signal(text), ImplementationVerdict::Continue);
        assert_eq!(RefinementVerdict::from_signal(text), RefinementVerdict::Unchanged);
    }

    #[test]
    fn exact_match_rejects_partial_keywords() {
        assert_eq!(
            ReviewVerdict::from_exact("APPROVE_COMPLETE"),
            Some(ReviewVerdict::ApproveComplete)
        );
        assert_eq!(ReviewVerdict::from_exact("approve"), None);
        assert_eq!(ReviewVerdict::from_exact("approve_complete please"), None);
    }

    #[test]
    fn keyword_matches_serde_name() {
        for verdict in ReviewVerdict::VOCABULARY {
            let json = serde_json::to_string(verdict).unwrap();
            assert_eq!(json, format!("\"{}\"", verdict.keyword()));
        }
    }

    #[test]
    fn vocabularies_list_defaults() {
        assert!(ReviewVerdict::VOCABULARY.contains(&ReviewVerdict::SAFE_DEFAULT));
        assert_eq!(QualityGateVerdict::keywords(), vec!["needs_human", "approve"]);
    }
}
