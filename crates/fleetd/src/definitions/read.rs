//! Check predicates.

use std::collections::HashSet;

use fleetd_protocol::ReadVerdict;

use crate::catalog::{ReadSpec, ValueRef, Vars, string_list, value_text};

/// Evaluate `spec` against the variables produced by a run.
pub fn evaluate(spec: &ReadSpec, vars: &Vars) -> ReadVerdict {
    match spec {
        ReadSpec::ContainsString {
            input,
            needle,
            case_sensitive,
        } => contains_string(
            &resolve_text(input, vars),
            &resolve_text(needle, vars),
            case_sensitive.unwrap_or(false),
        ),
        ReadSpec::ContainsAnyString {
            input,
            needles,
            case_sensitive,
        } => contains_any_string(
            &resolve_text(input, vars),
            &resolve_list(needles, vars),
            case_sensitive.unwrap_or(false),
        ),
        ReadSpec::ContainsLinesUnordered {
            input,
            lines,
            require_all,
        } => contains_lines_unordered(
            &resolve_text(input, vars),
            &resolve_list(lines, vars),
            require_all.unwrap_or(true),
        ),
    }
}

/// A `{"ref": name}` reads the variable. A bare string names a variable when
/// one exists and is taken literally otherwise.
fn resolve_text(value: &ValueRef<String>, vars: &Vars) -> String {
    match value {
        ValueRef::Ref { name } => vars.get(name.trim()).map(value_text).unwrap_or_default(),
        ValueRef::Literal(text) => match vars.get(text) {
            Some(var) if !var.is_null() => value_text(var),
            _ => text.clone(),
        },
    }
}

fn resolve_list(value: &ValueRef<Vec<String>>, vars: &Vars) -> Vec<String> {
    match value {
        ValueRef::Ref { name } => string_list(vars.get(name.trim())),
        ValueRef::Literal(items) => items
            .iter()
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    }
}

fn contains_string(haystack: &str, needle: &str, case_sensitive: bool) -> ReadVerdict {
    let passed = if case_sensitive {
        haystack.contains(needle)
    } else {
        haystack.to_lowercase().contains(&needle.to_lowercase())
    };
    let needles = if needle.is_empty() {
        Vec::new()
    } else {
        vec![needle.to_string()]
    };
    ReadVerdict {
        passed,
        kind: "contains_string".to_string(),
        details: if passed {
            "Substring found."
        } else {
            "Substring not found."
        }
        .to_string(),
        matched: if passed { needles.clone() } else { Vec::new() },
        missing: if passed { Vec::new() } else { needles },
        line_count: None,
        require_all: None,
    }
}

fn contains_any_string(haystack: &str, needles: &[String], case_sensitive: bool) -> ReadVerdict {
    let lowered = haystack.to_lowercase();
    let (matched, missing): (Vec<String>, Vec<String>) =
        needles.iter().cloned().partition(|needle| {
            if case_sensitive {
                haystack.contains(needle.as_str())
            } else {
                lowered.contains(&needle.to_lowercase())
            }
        });
    let passed = !matched.is_empty();
    ReadVerdict {
        passed,
        kind: "contains_any_string".to_string(),
        details: if passed {
            "At least one string found."
        } else {
            "No strings found."
        }
        .to_string(),
        matched,
        missing,
        line_count: None,
        require_all: None,
    }
}

fn contains_lines_unordered(haystack: &str, expected: &[String], require_all: bool) -> ReadVerdict {
    let lines: Vec<&str> = haystack
        .split('\n')
        .map(|line| line.trim_matches(|c: char| c == '\r' || c.is_whitespace()))
        .filter(|line| !line.is_empty())
        .collect();
    let present: HashSet<&str> = lines.iter().copied().collect();

    let (matched, missing): (Vec<String>, Vec<String>) = expected
        .iter()
        .cloned()
        .partition(|line| present.contains(line.as_str()));

    let (passed, details) = if expected.is_empty() {
        (false, "No expected lines configured.".to_string())
    } else if require_all {
        if missing.is_empty() {
            (true, "Expected lines found.".to_string())
        } else {
            (false, format!("Missing lines: {}", missing.join(", ")))
        }
    } else if matched.is_empty() {
        (false, "No expected lines were found.".to_string())
    } else {
        (true, "At least one expected line found.".to_string())
    };

    ReadVerdict {
        passed,
        kind: "contains_lines_unordered".to_string(),
        details,
        matched,
        missing,
        line_count: Some(lines.len()),
        require_all: Some(require_all),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> ReadSpec {
        serde_json::from_value(value).unwrap()
    }

    fn vars(value: serde_json::Value) -> Vars {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("vars must be an object"),
        }
    }

    #[test]
    fn test_contains_string_is_case_insensitive_by_default() {
        let scope = vars(json!({"out": "ROS Master running"}));
        let verdict = evaluate(
            &spec(json!({"kind": "contains_string", "inputRef": "out", "needle": "ros master"})),
            &scope,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.matched, vec!["ros master"]);

        let verdict = evaluate(
            &spec(json!({
                "kind": "contains_string",
                "inputRef": "out",
                "needle": "ros master",
                "caseSensitive": true
            })),
            &scope,
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.details, "Substring not found.");
        assert_eq!(verdict.missing, vec!["ros master"]);
    }

    #[test]
    fn test_bare_string_falls_back_to_literal() {
        let scope = vars(json!({}));
        let verdict = evaluate(
            &spec(json!({"kind": "contains_string", "inputRef": "hello world", "needle": "world"})),
            &scope,
        );
        assert!(verdict.passed);
    }

    #[test]
    fn test_contains_any_string() {
        let scope = vars(json!({"out": "eth0: UP\nwlan0: DOWN"}));
        let verdict = evaluate(
            &spec(json!({
                "kind": "contains_any_string",
                "inputRef": "out",
                "needles": ["usb0", "wlan0"]
            })),
            &scope,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.matched, vec!["wlan0"]);
        assert_eq!(verdict.missing, vec!["usb0"]);

        let verdict = evaluate(
            &spec(json!({"kind": "contains_any_string", "inputRef": "out", "needles": []})),
            &scope,
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.details, "No strings found.");
    }

    #[test]
    fn test_contains_lines_unordered_require_all() {
        let scope = vars(json!({
            "topics": "/odom\r\n  /scan \n\n/tf",
            "required": ["/scan", "/odom", "/imu"]
        }));
        let verdict = evaluate(
            &spec(json!({
                "kind": "contains_lines_unordered",
                "inputRef": "topics",
                "lines": {"ref": "required"}
            })),
            &scope,
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.details, "Missing lines: /imu");
        assert_eq!(verdict.matched, vec!["/scan", "/odom"]);
        assert_eq!(verdict.line_count, Some(3));
        assert_eq!(verdict.require_all, Some(true));

        let verdict = evaluate(
            &spec(json!({
                "kind": "contains_lines_unordered",
                "inputRef": "topics",
                "lines": {"ref": "required"},
                "requireAll": false
            })),
            &scope,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.details, "At least one expected line found.");
    }

    #[test]
    fn test_contains_lines_without_expectations_fails() {
        let scope = vars(json!({"topics": "/odom"}));
        let verdict = evaluate(
            &spec(json!({"kind": "contains_lines_unordered", "inputRef": "topics"})),
            &scope,
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.details, "No expected lines configured.");
    }
}
