//! Parsers for model output: the `<CHOICES>` block appended to STORY/REFLECT
//! chapters, and tolerant JSON extraction for the structured completions.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static CHOICE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<choices>\s*(.*?)\s*(?:</choices>|\z)").expect("choice block regex")
});

static CHOICE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:choice\s+)?[a-c1-3][:.)\-]\s*(.+?)\s*$").expect("choice line regex")
});

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fenced json regex")
});

/// Split streamed chapter text into cleaned narrative and the choice texts
/// found in its `<CHOICES>` block.
///
/// Tolerant of a missing closing tag (truncated streams) and of `A)` / `1.`
/// style line prefixes. Returns the narrative with the block stripped and
/// whatever choices could be recovered; the caller decides whether the count
/// is acceptable.
pub fn parse_choice_block(raw: &str) -> (String, Vec<String>) {
    let Some(found) = CHOICE_BLOCK.captures(raw) else {
        return (raw.trim_end().to_string(), Vec::new());
    };

    let block = found.get(1).map(|m| m.as_str()).unwrap_or_default();
    let choices: Vec<String> = block
        .lines()
        .filter_map(|line| CHOICE_LINE.captures(line))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .take(3)
        .collect();

    let cleaned = CHOICE_BLOCK.replace(raw, "").trim_end().to_string();
    (cleaned, choices)
}

/// Pull a JSON value out of a model response: raw JSON, a fenced block, or
/// the first balanced object found in surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Some(found) = FENCED_JSON.captures(trimmed) {
        if let Some(inner) = found.get(1) {
            if let Ok(value) = serde_json::from_str(inner.as_str()) {
                return Some(value);
            }
        }
    }

    balanced_object(trimmed).and_then(|span| serde_json::from_str(span).ok())
}

/// First `{ ... }` span with balanced braces, ignoring braces inside strings.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a summary completion into `(title, summary)`.
pub fn parse_summary_response(text: &str) -> Option<(String, String)> {
    let value = extract_json(text)?;
    let title = value.get("title")?.as_str()?.trim().to_string();
    let summary = value.get("summary")?.as_str()?.trim().to_string();
    if title.is_empty() || summary.is_empty() {
        return None;
    }
    Some((title, summary))
}

/// Parse a character-visual update into a name → description delta. Parse
/// failure or non-string entries yield an empty delta; the update is simply
/// skipped, never an error.
pub fn parse_visual_update(text: &str) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = extract_json(text) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(name, value)| {
            let description = value.as_str()?.trim();
            if name.trim().is_empty() || description.is_empty() {
                return None;
            }
            Some((name, description.to_string()))
        })
        .collect()
}
