//! Restricted condition evaluator for edges and `condition` nodes.
//!
//! There is no expression language here: a condition is one
//! `field <operator> value` comparison. Evaluation never errors. Anything
//! that cannot be compared (bad coercion, unsupported operator) is `false`.

use flowgate_types::workflow::{Condition, ConditionOperator};
use serde_json::Value;

use super::interpolate::{interpolate_value, lookup_path};

/// Evaluate a condition against the merged context view.
///
/// The left side is a path into the view (or a `{{...}}` template, which is
/// interpolated). A path that does not resolve compares as `null`. The right
/// side is interpolated.
pub fn evaluate(condition: &Condition, view: &Value) -> bool {
    let left = resolve_left(&condition.field, view);
    let right = interpolate_value(&condition.value, view);
    compare(&left, &condition.operator, &right)
}

fn resolve_left(field: &str, view: &Value) -> Value {
    if field.contains("{{") {
        interpolate_value(&Value::String(field.to_string()), view)
    } else {
        lookup_path(view, field).cloned().unwrap_or(Value::Null)
    }
}

/// Apply `op` to two already-resolved operands.
pub fn compare(left: &Value, op: &ConditionOperator, right: &Value) -> bool {
    match op {
        ConditionOperator::Eq => loose_eq(left, right),
        ConditionOperator::Ne => !loose_eq(left, right),
        ConditionOperator::Gt => ordered(left, right, |a, b| a > b),
        ConditionOperator::Gte => ordered(left, right, |a, b| a >= b),
        ConditionOperator::Lt => ordered(left, right, |a, b| a < b),
        ConditionOperator::Lte => ordered(left, right, |a, b| a <= b),
        ConditionOperator::Contains => contains(left, right),
        ConditionOperator::In => contains(right, left),
        ConditionOperator::Unsupported(op) => {
            tracing::debug!(operator = %op, "unsupported condition operator evaluates to false");
            false
        }
    }
}

/// Loose equality: numbers, numeric strings and booleans compare by numeric
/// value; null only equals null; composites compare element-wise.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| loose_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| loose_eq(v, other)))
        }
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        (a, b) => match (to_number(a), to_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

fn ordered(left: &Value, right: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (to_number(left), to_number(right)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// `haystack contains needle`: substring for strings, loose membership for
/// arrays, key presence for objects.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => s.contains(n.as_str()),
            Value::Number(n) => s.contains(&n.to_string()),
            Value::Bool(b) => s.contains(&b.to_string()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

/// Numeric coercion. Non-numeric strings, null and composites do not coerce.
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
        }
        _ => None,
    }
}

/// JSON truthiness used where a value stands in for a boolean.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(field: &str, op: &str, value: Value) -> Condition {
        Condition::new(field, ConditionOperator::from(op.to_string()), value)
    }

    #[test]
    fn test_gt_with_non_numeric_string_is_false() {
        let view = json!({"score": 85});
        assert!(!evaluate(&cond("score", ">", json!("abc")), &view));
        assert!(!evaluate(&cond("score", "<", json!("abc")), &view));
    }

    #[test]
    fn test_numeric_comparisons_coerce_strings() {
        let view = json!({"score": "85"});
        assert!(evaluate(&cond("score", ">", json!(70)), &view));
        assert!(evaluate(&cond("score", ">=", json!("85")), &view));
        assert!(evaluate(&cond("score", "<=", json!(85.0)), &view));
        assert!(!evaluate(&cond("score", "<", json!(85)), &view));
    }

    #[test]
    fn test_loose_equality() {
        assert!(loose_eq(&json!(1), &json!("1")));
        assert!(loose_eq(&json!(true), &json!(1)));
        assert!(loose_eq(&json!("1.0"), &json!(1)));
        assert!(loose_eq(&json!(null), &json!(null)));
        assert!(!loose_eq(&json!(null), &json!(0)));
        assert!(!loose_eq(&json!("abc"), &json!(0)));
        assert!(loose_eq(&json!([1, "2"]), &json!(["1", 2])));
        assert!(loose_eq(&json!({"a": 1}), &json!({"a": "1"})));
        assert!(!loose_eq(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_not_equal() {
        let view = json!({"status": "open"});
        assert!(evaluate(&cond("status", "!=", json!("closed")), &view));
        assert!(!evaluate(&cond("status", "!=", json!("open")), &view));
    }

    #[test]
    fn test_contains_and_in() {
        let view = json!({"tags": ["urgent", "billing"], "title": "Refund request", "meta": {"vip": true}});
        assert!(evaluate(&cond("tags", "contains", json!("urgent")), &view));
        assert!(evaluate(&cond("title", "contains", json!("Refund")), &view));
        assert!(evaluate(&cond("meta", "contains", json!("vip")), &view));
        assert!(!evaluate(&cond("tags", "contains", json!("sales")), &view));

        let view = json!({"plan": "pro"});
        assert!(evaluate(&cond("plan", "in", json!(["pro", "team"])), &view));
        assert!(!evaluate(&cond("plan", "in", json!(["free"])), &view));
    }

    #[test]
    fn test_unsupported_operator_fails_closed() {
        let view = json!({"a": 1});
        assert!(!evaluate(&cond("a", "=~", json!(1)), &view));
        assert!(!evaluate(&cond("a", "", json!(1)), &view));
    }

    #[test]
    fn test_missing_field_compares_as_null() {
        let view = json!({});
        assert!(!evaluate(&cond("nope", ">", json!(0)), &view));
        assert!(evaluate(&cond("nope", "==", json!(null)), &view));
    }

    #[test]
    fn test_template_operands() {
        let view = json!({"fetch": {"status": 200}, "expected": 200});
        assert!(evaluate(&cond("{{fetch.status}}", "==", json!("{{expected}}")), &view));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!("false")));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([0])));
        assert!(is_truthy(&json!({})));
    }
}
