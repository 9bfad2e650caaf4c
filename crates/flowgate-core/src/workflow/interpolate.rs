//! `{{path}}` template interpolation over JSON values.
//!
//! Tokens resolve against a merged view of the execution context (see
//! `ExecutionContext::view`). Rules:
//!
//! - Paths use dots and numeric indices: `node.body.items.0.id` or
//!   `node.body.items[0].id`.
//! - A token that does not resolve is left in place verbatim, braces and
//!   whitespace included.
//! - A string consisting of exactly one token is replaced by the raw JSON
//!   value, so `"{{trigger.count}}"` stays a number.
//! - Otherwise resolved values are stringified in place.
//! - Arrays and objects are walked recursively; only string leaves change,
//!   object keys never do.

use serde_json::Value;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Resolve a dotted / indexed path inside `root`.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let normalized = path.trim().replace('[', ".").replace(']', "");
    let mut current = root;
    for segment in normalized.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Interpolate every string leaf of `value`.
pub fn interpolate_value(value: &Value, view: &Value) -> Value {
    match value {
        Value::String(s) => interpolate_str(s, view),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, view)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, view)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Interpolate a single template string.
pub fn interpolate_str(template: &str, view: &Value) -> Value {
    if let Some(path) = sole_token(template) {
        if let Some(found) = lookup_path(view, path) {
            return found.clone();
        }
        return Value::String(template.to_string());
    }
    Value::String(render(template, view))
}

/// Interpolate and always return a string.
pub fn render(template: &str, view: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        out.push_str(&rest[..start]);

        let path = after_open[..end].trim();
        let token_len = OPEN.len() + end + CLOSE.len();
        match (!path.is_empty()).then(|| lookup_path(view, path)).flatten() {
            Some(value) => out.push_str(&value_to_string(value)),
            None => out.push_str(&rest[start..start + token_len]),
        }
        rest = &rest[start + token_len..];
    }

    out.push_str(rest);
    out
}

/// If `template` is exactly one `{{path}}` token, return the trimmed path.
fn sole_token(template: &str) -> Option<&str> {
    let inner = template.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    let path = inner.trim();
    (!path.is_empty()).then_some(path)
}

/// Convert a JSON value to a display string for template resolution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // For objects/arrays, return compact JSON
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
