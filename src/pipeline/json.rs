//! Lenient extraction of a JSON object from model output.
//!
//! Models wrap JSON in Markdown fences, add prose around it, leave trailing commas,
//! put raw newlines inside strings, and write LaTeX backslashes unescaped. The first
//! decodable object wins; when nothing decodes, the text is repaired once and decoded
//! again. Truncated output is never completed: it must go back to the model.

use serde::Deserialize;
use serde_json::{Map, Value};

/// Give up scanning after this many `{` candidates.
const MAX_CANDIDATES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonExtractError {
    #[error("no JSON object found in model output")]
    NoObject,

    #[error("invalid JSON: {0}")]
    Invalid(String),
}

/// Decode the first JSON value at the start of `text`, ignoring whatever follows.
fn decode_prefix(text: &str) -> Result<Value, serde_json::Error> {
    let mut de = serde_json::Deserializer::from_str(text);
    Value::deserialize(&mut de)
}

fn candidates(text: &str) -> impl Iterator<Item = &str> {
    text.match_indices('{')
        .take(MAX_CANDIDATES)
        .map(move |(idx, _)| &text[idx..])
}

fn first_object<'a>(mut items: impl Iterator<Item = &'a str>) -> Result<Map<String, Value>, String> {
    let mut first_error = None;
    for candidate in items.by_ref() {
        match decode_prefix(candidate) {
            Ok(Value::Object(map)) => return Ok(map),
            Ok(_) => continue,
            Err(e) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
        }
    }
    Err(first_error.unwrap_or_else(|| "no object".to_string()))
}

/// Extract the first JSON object in `text`.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, JsonExtractError> {
    if !text.contains('{') {
        return Err(JsonExtractError::NoObject);
    }
    let error = match first_object(candidates(text)) {
        Ok(map) => return Ok(map),
        Err(e) => e,
    };

    let repaired = repair(text);
    if repaired != text {
        if let Ok(map) = first_object(candidates(&repaired)) {
            tracing::debug!("Recovered model JSON after repair");
            return Ok(map);
        }
    }
    Err(JsonExtractError::Invalid(error))
}

/// Fix common model mistakes without changing well-formed JSON.
///
/// Outside strings: trailing commas before `}` or `]` are dropped. Inside strings: raw
/// control characters are escaped and backslashes that do not start a valid JSON
/// escape are doubled.
pub fn repair(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\\' => {
                    let next = chars.get(i + 1).copied();
                    if is_valid_escape(&chars, i + 1) {
                        out.push('\\');
                        if let Some(n) = next {
                            out.push(n);
                        }
                        i += 2;
                        continue;
                    }
                    out.push_str("\\\\");
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                _ => out.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                ',' => {
                    let mut j = i + 1;
                    while j < chars.len() && chars[j].is_whitespace() {
                        j += 1;
                    }
                    if !matches!(chars.get(j), Some('}') | Some(']')) {
                        out.push(c);
                    }
                }
                _ => out.push(c),
            }
        }
        i += 1;
    }
    out
}

fn is_valid_escape(chars: &[char], at: usize) -> bool {
    match chars.get(at) {
        Some('"') | Some('\\') | Some('/') | Some('b') | Some('f') | Some('n') | Some('r')
        | Some('t') => true,
        Some('u') => (1..=4).all(|k| chars.get(at + k).is_some_and(|h| h.is_ascii_hexdigit())),
        _ => false,
    }
}

/// Read a string field, accepting numbers and booleans as text.
pub fn lenient_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Read a list of strings, accepting a single string or mixed scalars.
pub fn lenient_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| lenient_string(Some(item)))
            .collect(),
        Some(other) => lenient_string(Some(other)).into_iter().collect(),
        None => Vec::new(),
    }
}
