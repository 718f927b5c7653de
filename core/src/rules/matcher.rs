// Rule matching: trigger, path glob and condition evaluation
// Field lookup is dotted-path map indexing over the event payload with
// type-tolerant comparisons

use globset::Glob;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Trigger specification: a direct event type and/or a list of `any`
/// alternatives, each with its own event and optional glob
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<TriggerAlt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerAlt {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
}

/// Condition operators; the `$`-prefixed spellings are accepted as aliases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CondOp {
    #[serde(alias = "=", alias = "$eq")]
    Eq,
    #[serde(alias = "$ne")]
    Ne,
    #[serde(alias = "$gt")]
    Gt,
    #[serde(alias = "$gte")]
    Gte,
    #[serde(alias = "$lt")]
    Lt,
    #[serde(alias = "$lte")]
    Lte,
    #[serde(alias = "$in")]
    In,
    #[serde(alias = "$regex")]
    Regex,
    #[serde(alias = "$glob")]
    Glob,
}

/// One condition; all of a rule's conditions AND together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: CondOp,
    pub value: Value,
}

/// Evaluate trigger + conditions against an event
pub fn matches_event(
    trigger: &Trigger,
    conditions: &[Condition],
    event_type: &str,
    event: &Value,
) -> bool {
    let path = event.get("path").and_then(|v| v.as_str()).unwrap_or("");

    // Direct trigger, or the first `any` alternative that satisfies itself
    let trigger_hit = match &trigger.kind {
        Some(kind) if kind == event_type => match &trigger.path_glob {
            Some(glob) => glob_match(glob, path),
            None => true,
        },
        _ => trigger.any.iter().any(|alt| {
            alt.event == event_type
                && alt
                    .path_glob
                    .as_deref()
                    .map(|glob| glob_match(glob, path))
                    .unwrap_or(true)
        }),
    };
    if !trigger_hit {
        return false;
    }

    conditions
        .iter()
        .all(|cond| check_condition(cond, event))
}

fn check_condition(cond: &Condition, event: &Value) -> bool {
    let actual = lookup(event, &cond.field);
    compare(cond.op, actual, &cond.value)
}

/// Dotted-path lookup into the event payload (`file.extension`)
fn lookup<'a>(event: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = event;
    for part in dotted.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Numbers compare as f64; numeric strings are coerced
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        // Strings compare case-insensitively
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => {
            if let (Some(a), Some(b)) = (as_number(a), as_number(b)) {
                a == b
            } else {
                a == b
            }
        }
    }
}

fn compare(op: CondOp, actual: Option<&Value>, expected: &Value) -> bool {
    let Some(actual) = actual else {
        // A missing field only satisfies "not equal"
        return op == CondOp::Ne;
    };

    match op {
        CondOp::Eq => loose_eq(actual, expected),
        CondOp::Ne => !loose_eq(actual, expected),
        CondOp::Gt | CondOp::Gte | CondOp::Lt | CondOp::Lte => {
            let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) else {
                return false;
            };
            match op {
                CondOp::Gt => a > b,
                CondOp::Gte => a >= b,
                CondOp::Lt => a < b,
                CondOp::Lte => a <= b,
                _ => unreachable!(),
            }
        }
        CondOp::In => match expected {
            Value::Array(items) => items.iter().any(|item| loose_eq(actual, item)),
            _ => false,
        },
        CondOp::Regex => {
            let (Some(pattern), text) = (expected.as_str(), value_text(actual)) else {
                return false;
            };
            match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(&text),
                Err(e) => {
                    warn!("bad regex in condition: {}", e);
                    false
                }
            }
        }
        CondOp::Glob => {
            let (Some(pattern), text) = (expected.as_str(), value_text(actual)) else {
                return false;
            };
            glob_match(pattern, &text)
        }
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Glob matching with `*` crossing path separators, like shell fnmatch
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(text),
        Err(e) => {
            warn!("bad glob pattern {}: {}", pattern, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn file_event() -> Value {
        json!({
            "path": "/rec/session one.mkv",
            "asset_id": "abc123",
            "role": "recordings",
            "file": {
                "name": "session one.mkv",
                "extension": "mkv",
                "size": 5000000000i64,
            },
            "duration_sec": 1200,
        })
    }

    fn cond(field: &str, op: &str, value: Value) -> Condition {
        serde_json::from_value(json!({"field": field, "op": op, "value": value})).unwrap()
    }

    #[test]
    fn test_trigger_type_must_match() {
        let trigger: Trigger = serde_json::from_value(json!({"type": "file_closed"})).unwrap();
        assert!(matches_event(&trigger, &[], "file_closed", &file_event()));
        assert!(!matches_event(&trigger, &[], "file_opened", &file_event()));
    }

    #[test]
    fn test_trigger_path_glob() {
        let trigger: Trigger =
            serde_json::from_value(json!({"type": "file_closed", "path_glob": "/rec/*.mkv"})).unwrap();
        assert!(matches_event(&trigger, &[], "file_closed", &file_event()));

        let trigger: Trigger =
            serde_json::from_value(json!({"type": "file_closed", "path_glob": "/other/*.mkv"})).unwrap();
        assert!(!matches_event(&trigger, &[], "file_closed", &file_event()));
    }

    #[test]
    fn test_any_alternatives_or_logic() {
        let trigger: Trigger = serde_json::from_value(json!({
            "any": [
                {"event": "file_closed", "path_glob": "*.flv"},
                {"event": "file_closed", "path_glob": "*.mkv"},
                {"event": "manual_scan"}
            ]
        }))
        .unwrap();

        assert!(matches_event(&trigger, &[], "file_closed", &file_event()));
        assert!(matches_event(&trigger, &[], "manual_scan", &file_event()));
        assert!(!matches_event(&trigger, &[], "file_deleted", &file_event()));
    }

    #[test]
    fn test_dotted_lookup_and_eq_case_insensitive() {
        let trigger: Trigger = serde_json::from_value(json!({"type": "file_closed"})).unwrap();
        let conditions = vec![cond("file.extension", "eq", json!("MKV"))];
        assert!(matches_event(&trigger, &conditions, "file_closed", &file_event()));

        let conditions = vec![cond("file.extension", "eq", json!("mov"))];
        assert!(!matches_event(&trigger, &conditions, "file_closed", &file_event()));
    }

    #[test]
    fn test_numeric_operators() {
        let event = file_event();
        assert!(compare(CondOp::Gt, lookup(&event, "duration_sec"), &json!(600)));
        assert!(compare(CondOp::Gte, lookup(&event, "duration_sec"), &json!(1200)));
        assert!(compare(CondOp::Lt, lookup(&event, "duration_sec"), &json!(1201)));
        assert!(compare(CondOp::Lte, lookup(&event, "duration_sec"), &json!(1200)));
        assert!(!compare(CondOp::Gt, lookup(&event, "duration_sec"), &json!(1200)));

        // Numeric strings coerce
        assert!(compare(CondOp::Gt, Some(&json!("42")), &json!(10)));
    }

    #[test]
    fn test_in_and_regex_and_glob_ops() {
        let event = file_event();

        assert!(compare(
            CondOp::In,
            lookup(&event, "file.extension"),
            &json!(["mp4", "mkv", "mov"])
        ));
        assert!(!compare(CondOp::In, lookup(&event, "file.extension"), &json!(["mp4"])));

        assert!(compare(CondOp::Regex, lookup(&event, "path"), &json!(r"session \w+")));
        assert!(!compare(CondOp::Regex, lookup(&event, "path"), &json!(r"^/editing/")));

        assert!(compare(CondOp::Glob, lookup(&event, "path"), &json!("/rec/*.mkv")));
    }

    #[test]
    fn test_missing_field_only_satisfies_ne() {
        let event = file_event();
        assert!(!compare(CondOp::Eq, lookup(&event, "file.codec"), &json!("h264")));
        assert!(compare(CondOp::Ne, lookup(&event, "file.codec"), &json!("h264")));
        assert!(!compare(CondOp::Gt, lookup(&event, "file.codec"), &json!(1)));
    }

    #[test]
    fn test_dollar_prefixed_op_aliases() {
        let c: Condition =
            serde_json::from_value(json!({"field": "duration_sec", "op": "$gte", "value": 900}))
                .unwrap();
        assert_eq!(c.op, CondOp::Gte);

        let c: Condition =
            serde_json::from_value(json!({"field": "file.extension", "op": "=", "value": "mkv"}))
                .unwrap();
        assert_eq!(c.op, CondOp::Eq);
    }

    #[test]
    fn test_conditions_and_together() {
        let trigger: Trigger = serde_json::from_value(json!({"type": "file_closed"})).unwrap();
        let conditions = vec![
            cond("file.extension", "eq", json!("mkv")),
            cond("file.size", "gte", json!(1000000)),
            cond("role", "in", json!(["recordings"])),
        ];
        assert!(matches_event(&trigger, &conditions, "file_closed", &file_event()));

        let mut failing = conditions.clone();
        failing.push(cond("duration_sec", "lt", json!(60)));
        assert!(!matches_event(&trigger, &failing, "file_closed", &file_event()));
    }
}
