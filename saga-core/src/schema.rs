//! Validation of structured model replies.
//!
//! Replies are parsed as JSON after stripping markdown fences and any prose
//! around the payload, then read through alias-aware accessors so that the
//! rest of the engine only sees canonical types.

use crate::error::{SchemaError, SchemaResult};
use serde_json::{Map, Value};

/// Strip markdown code fences and surrounding prose from a model reply.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Leading or trailing prose around a bare object
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Parse a reply into a JSON object.
pub fn parse_object(text: &str) -> SchemaResult<Map<String, Value>> {
    let payload = extract_json(text);
    let value: Value =
        serde_json::from_str(payload).map_err(|e| SchemaError::NotJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SchemaError::NotObject),
    }
}

/// First present value among `aliases`.
pub fn value_any<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| !v.is_null())
}

/// First string among `aliases`, trimmed. Numbers are rendered as text.
pub fn str_any(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|key| match obj.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// First number among `aliases`. Numeric strings are accepted.
pub fn f64_any(obj: &Map<String, Value>, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|key| match obj.get(*key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// First non-negative integer among `aliases`.
///
/// Accepts `12`, `12.0`, `"12"` and strings such as `"第12章"` or
/// `"Chapter 12"` by reading the first run of digits.
pub fn u32_any(obj: &Map<String, Value>, aliases: &[&str]) -> Option<u32> {
    aliases.iter().find_map(|key| match obj.get(*key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => first_digits(s),
        _ => None,
    })
}

/// First array among `aliases`.
pub fn array_any<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Vec<Value>> {
    aliases.iter().find_map(|key| obj.get(*key).and_then(Value::as_array))
}

/// Strings of an array field; non-string items are skipped.
pub fn strings_any(obj: &Map<String, Value>, aliases: &[&str]) -> Vec<String> {
    array_any(obj, aliases)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Objects of an array field; non-object items are skipped.
pub fn objects_any<'a>(
    obj: &'a Map<String, Value>,
    aliases: &[&str],
) -> Vec<&'a Map<String, Value>> {
    array_any(obj, aliases)
        .map(|items| items.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

/// A required, non-blank string field.
pub fn require_non_empty(obj: &Map<String, Value>, field: &str, aliases: &[&str]) -> SchemaResult<String> {
    match value_any(obj, aliases) {
        None => Err(SchemaError::MissingField {
            field: field.to_string(),
        }),
        Some(_) => str_any(obj, aliases).ok_or_else(|| SchemaError::EmptyField {
            field: field.to_string(),
        }),
    }
}

/// Map a raw string onto one of a closed set of values.
///
/// Matching is case-insensitive and treats `-`, `_` and spaces alike.
pub fn parse_enum<T: Copy>(field: &str, raw: &str, table: &[(&str, T)]) -> SchemaResult<T> {
    let wanted = canonical_token(raw);
    table
        .iter()
        .find(|(name, _)| canonical_token(name) == wanted)
        .map(|(_, value)| *value)
        .ok_or_else(|| SchemaError::InvalidEnum {
            field: field.to_string(),
            value: raw.to_string(),
        })
}

/// Enforce an upper bound on an array length.
pub fn bounded<T>(field: &str, items: Vec<T>, max: usize) -> SchemaResult<Vec<T>> {
    if items.len() > max {
        return Err(SchemaError::TooMany {
            field: field.to_string(),
            max,
            found: items.len(),
        });
    }
    Ok(items)
}

/// Clamp a model-reported score onto 0..=10.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 10.0)
    } else {
        0.0
    }
}

fn canonical_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn first_digits(s: &str) -> Option<u32> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
