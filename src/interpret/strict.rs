//! Strict-schema responses: agents answer with a JSON object whose `verdict`
//! is exactly one vocabulary keyword.
//!
//! ```json
//! {"verdict": "revise", "description": "...", "issues": ["..."]}
//! ```

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct StrictResponse {
    pub verdict: String,
    #[serde(default, alias = "summary")]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub question: Option<String>,
}

/// Parse the first JSON object found in `response`.
pub fn parse(response: &str) -> Option<StrictResponse> {
    let json = extract_json(response)?;
    serde_json::from_str(&json).ok()
}

/// Locate a JSON object: a ```json fence, any fence, then a raw
/// brace-balanced object.
fn extract_json(response: &str) -> Option<String> {
    if let Some(start) = response.find("```json") {
        let after_marker = &response[start + 7..];
        if let Some(end) = after_marker.find("```") {
            return Some(after_marker[..end].trim().to_string());
        }
    }

    if let Some(start) = response.find("```") {
        let after_marker = &response[start + 3..];
        if let Some(end) = after_marker.find("```")
            && let Some(json_start) = after_marker[..end].find('{')
        {
            return Some(after_marker[json_start..end].trim().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(response[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
