//! Heuristic field extraction from raw agent text.
//!
//! Runs on the agent's original output, never on the classifier's signal.
//! Every function is total: unrecognised input produces `None` or an empty
//! list.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

static DESCRIPTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s>*#-]*(?:\*\*)?(?:description|summary)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.+?)\s*$")
        .unwrap()
});

static QUESTION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[\s>*#-]*(?:\*\*)?(?:clarifying question|question|clarification needed)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.+?)\s*$",
    )
    .unwrap()
});

static ISSUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s>*#-]*(?:\*\*)?(?:issue|problem|concern)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.+?)\s*$").unwrap()
});

static STEP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:\d{1,3}[.)]|[-*•+])\s+(.+?)\s*$").unwrap());

static PATH_CHARS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-/]+$").unwrap());

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "toml", "py", "ts", "tsx", "js", "jsx", "mjs", "go", "java", "kt", "rb", "c", "h",
    "cc", "cpp", "hpp", "cs", "swift", "php", "scala", "md", "json", "yaml", "yml", "sql", "sh",
    "html", "css", "scss", "proto", "lock",
];

const PATH_PREFIXES: &[&str] = &[
    "src/", "lib/", "tests/", "test/", "crates/", "docs/", "app/", "pkg/", "cmd/", "internal/",
    "scripts/", "benches/", "migrations/", "config/", ".github/",
];

/// Every supplementary field the interpreter can scrape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    pub description: Option<String>,
    pub files: Vec<String>,
    pub steps: Vec<String>,
    pub question: Option<String>,
    pub issues: Vec<String>,
}

impl Extracted {
    pub fn from_text(text: &str, min_description_len: usize) -> Self {
        Self {
            description: description(text, min_description_len),
            files: file_paths(text),
            steps: steps(text),
            question: question(text, min_description_len),
            issues: issues(text),
        }
    }
}

/// An explicit `description:` / `summary:` line, else the first sentence at
/// least `min_len` characters long.
pub fn description(text: &str, min_len: usize) -> Option<String> {
    if let Some(cap) = DESCRIPTION_REGEX.captures(text)
        && let Some(m) = cap.get(1)
    {
        let value = strip_markup(m.as_str());
        if !value.is_empty() {
            return Some(value);
        }
    }
    sentences(text).into_iter().find(|s| s.chars().count() >= min_len)
}

/// Paths recognised by a known source extension or a known directory prefix.
///
/// Deduplicated, in order of first appearance. URLs are ignored.
pub fn file_paths(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for raw in text.split_whitespace() {
        if raw.contains("://") {
            continue;
        }
        let token = raw
            .trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '(' | ')' | '[' | ']' | '<' | '>' | ',' | ';' | '*'))
            .trim_end_matches([':', '.', '!', '?']);
        let token = token.strip_prefix("./").unwrap_or(token);
        if token.is_empty() || !PATH_CHARS_REGEX.is_match(token) {
            continue;
        }
        if looks_like_path(token) && seen.insert(token.to_string()) {
            files.push(token.to_string());
        }
    }

    files
}

fn looks_like_path(token: &str) -> bool {
    if PATH_PREFIXES.iter().any(|p| token.starts_with(p) && token.len() > p.len()) {
        return true;
    }
    let Some((stem, ext)) = token.rsplit_once('.') else {
        return false;
    };
    let file_stem = stem.rsplit('/').next().unwrap_or(stem);
    !file_stem.is_empty()
        && !stem.ends_with('.')
        && SOURCE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Numbered or bulleted lines, with their markers removed.
pub fn steps(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| STEP_REGEX.captures(line))
        .filter_map(|cap| cap.get(1).map(|m| strip_markup(m.as_str())))
        .filter(|s| !s.is_empty())
        .collect()
}

/// An explicit question marker, else the first sentence containing `?`,
/// else the first substantial sentence.
pub fn question(text: &str, min_len: usize) -> Option<String> {
    if let Some(cap) = QUESTION_REGEX.captures(text)
        && let Some(m) = cap.get(1)
    {
        let value = strip_markup(m.as_str());
        if !value.is_empty() {
            return Some(value);
        }
    }
    let sentences = sentences(text);
    sentences
        .iter()
        .find(|s| s.contains('?'))
        .or_else(|| sentences.iter().find(|s| s.chars().count() >= min_len))
        .cloned()
}

/// Lines carrying an explicit `issue:` marker.
pub fn issues(text: &str) -> Vec<String> {
    ISSUE_REGEX
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| strip_markup(m.as_str())))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split text into trimmed sentences.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a line
/// break. Headings, code fences and list markers are dropped.
pub fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let body = STEP_REGEX
            .captures(trimmed)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str())
            .unwrap_or(trimmed);

        let mut current = String::new();
        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            current.push(c);
            let at_boundary = matches!(c, '.' | '!' | '?')
                && chars.peek().is_none_or(|next| next.is_whitespace());
            if at_boundary {
                push_sentence(&mut out, &current);
                current.clear();
            }
        }
        push_sentence(&mut out, &current);
    }

    out
}

fn push_sentence(out: &mut Vec<String>, candidate: &str) {
    let cleaned = strip_markup(candidate);
    if cleaned.chars().any(char::is_alphanumeric) {
        out.push(cleaned);
    }
}

fn strip_markup(s: &str) -> String {
    s.trim().trim_matches(|c| c == '*' || c == '`' || c == '_').trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_prefers_explicit_marker() {
        let text = "Some preamble that is long enough to count.\n**Summary:** Added request validation\n";
        assert_eq!(
            description(text, 20).as_deref(),
            Some("Added request validation")
        );
    }

    #[test]
    fn description_falls_back_to_first_long_sentence() {
        let text = "Ok. Next I will add validation to the request handler. Then tests.";
        assert_eq!(
            description(text, 20).as_deref(),
            Some("Next I will add validation to the request handler.")
        );
        assert_eq!(description("Ok. Fine.", 20), None);
    }

    #[test]
    fn file_paths_match_extensions_and_prefixes() {
        let text = "Changed `src/api/handler.rs`, Cargo.toml and tests/fixtures/input.\n\
                    See https://example.com/docs/page.html and src/api/handler.rs again.";
        assert_eq!(
            file_paths(text),
            vec!["src/api/handler.rs", "Cargo.toml", "tests/fixtures/input"]
        );
    }

    #[test]
    fn file_paths_ignore_prose_and_versions() {
        assert!(file_paths("Version 1.2 is fine, e.g. this works.").is_empty());
        assert!(file_paths("src/ alone is not a path").is_empty());
    }

    #[test]
    fn steps_collect_numbered_and_bulleted_lines() {
        let text = "Plan:\n1. Add the struct\n2) Wire it up\n- **Write tests**\nNot a step";
        assert_eq!(
            steps(text),
            vec!["Add the struct", "Wire it up", "Write tests"]
        );
    }

    #[test]
    fn question_uses_marker_then_question_mark_then_sentence() {
        assert_eq!(
            question("needs_clarification\nQuestion: Which database should we target?", 10).as_deref(),
            Some("Which database should we target?")
        );
        assert_eq!(
            question("The task is vague. Should the cache be per user? Thanks.", 10).as_deref(),
            Some("Should the cache be per user?")
        );
        assert_eq!(
            question("Ok. The scope of the task is unclear to me.", 10).as_deref(),
            Some("The scope of the task is unclear to me.")
        );
    }

    #[test]
    fn issues_require_explicit_marker() {
        let text = "revise\nIssue: missing error handling in parse()\n- issue: no tests\nother issues exist";
        assert_eq!(
            issues(text),
            vec!["missing error handling in parse()", "no tests"]
        );
    }

    #[test]
    fn sentences_skip_headings_and_code() {
        let text = "# Heading\nFirst sentence here. Second one!\n```\nlet x = 1.0;\n```\n- bullet item";
        assert_eq!(
            sentences(text),
            vec!["First sentence here.", "Second one!", "bullet item"]
        );
    }

    #[test]
    fn extraction_of_garbage_is_empty() {
        let extracted = Extracted::from_text("... --- ???", 20);
        assert_eq!(extracted, Extracted::default());
    }
}
