//! Typed catalog entities.

use fleetd_protocol::TestStatus;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Named variable scope shared by the steps and checks of one definition run.
pub type Vars = Map<String, Value>;

/// Default port for robot shells.
pub const DEFAULT_SSH_PORT: u16 = 22;

// ============================================================================
// Robots
// ============================================================================

/// SSH credentials of a robot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub port: Option<u16>,
}

/// A fleet member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Robot {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Host name or address.
    #[serde(default, rename = "ip")]
    pub host: String,
    #[serde(default, rename = "type")]
    pub type_id: String,
    #[serde(default)]
    pub ssh: SshCredentials,
}

impl Robot {
    pub fn port(&self) -> u16 {
        self.ssh.port.unwrap_or(DEFAULT_SSH_PORT)
    }
}

/// Shared configuration for a class of robots, with test and fix references
/// already resolved against the definition catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotType {
    /// Lowercased type id.
    pub key: String,
    pub id: String,
    pub label: String,
    pub topics: Vec<String>,
    pub tests: Vec<TestEntry>,
    pub fixes: Vec<FixEntry>,
    /// Override for the background battery probe.
    pub battery_command: Option<String>,
}

impl RobotType {
    pub fn fix(&self, fix_id: &str) -> Option<&FixEntry> {
        self.fixes.iter().find(|fix| fix.id == fix_id)
    }

    pub fn test(&self, test_id: &str) -> Option<&TestEntry> {
        self.tests.iter().find(|test| test.id == test_id)
    }
}

/// One test as configured for a robot type.
#[derive(Debug, Clone, PartialEq)]
pub struct TestEntry {
    pub id: String,
    /// Definition that produces this test's result. `None` when the test id
    /// is not declared by any definition.
    pub definition_id: Option<String>,
    pub label: String,
    pub icon: String,
    pub manual_only: bool,
    pub enabled: bool,
    pub default_status: TestStatus,
    pub default_value: String,
    pub default_details: String,
    pub params: Vars,
}

impl TestEntry {
    /// Topics this test requires, from `params.requiredTopics`.
    pub fn required_topics(&self) -> Vec<String> {
        string_list(self.params.get("requiredTopics"))
    }
}

/// One fix as configured for a robot type.
#[derive(Debug, Clone, PartialEq)]
pub struct FixEntry {
    pub id: String,
    pub label: String,
    pub description: String,
    pub enabled: bool,
    pub params: Vars,
    pub post_test_ids: Vec<String>,
    pub execute: Vec<ExecuteStep>,
}

// ============================================================================
// Definitions
// ============================================================================

/// A literal value or a reference to a variable in the run scope.
///
/// `Literal` is tried first: a one-element list must not decode as a ref.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueRef<T> {
    Literal(T),
    Ref {
        #[serde(rename = "ref")]
        name: String,
    },
}

/// Reusable command template addressed as `$id$`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPrimitive {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub timeout_sec: Option<f64>,
    #[serde(default)]
    pub retries: Option<u32>,
}

/// One command step of a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteStep {
    #[serde(default)]
    pub id: String,
    pub command: ValueRef<String>,
    #[serde(default)]
    pub timeout_sec: Option<ValueRef<f64>>,
    #[serde(default)]
    pub retries: Option<ValueRef<u32>>,
    /// Variable that receives the command output.
    #[serde(default)]
    pub save_as: Option<String>,
    /// Cache key shared by steps that want the same output within a run.
    #[serde(default)]
    pub reuse_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionMode {
    #[default]
    Orchestrate,
    OnlineProbe,
}

/// Predicate evaluated against the variable scope after all steps ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadSpec {
    ContainsString {
        #[serde(rename = "inputRef")]
        input: ValueRef<String>,
        needle: ValueRef<String>,
        #[serde(default, rename = "caseSensitive", deserialize_with = "lenient_bool")]
        case_sensitive: Option<bool>,
    },
    ContainsAnyString {
        #[serde(rename = "inputRef")]
        input: ValueRef<String>,
        #[serde(default = "empty_list_ref")]
        needles: ValueRef<Vec<String>>,
        #[serde(default, rename = "caseSensitive", deserialize_with = "lenient_bool")]
        case_sensitive: Option<bool>,
    },
    ContainsLinesUnordered {
        #[serde(rename = "inputRef")]
        input: ValueRef<String>,
        #[serde(default = "empty_list_ref")]
        lines: ValueRef<Vec<String>>,
        #[serde(default, rename = "requireAll", deserialize_with = "lenient_bool")]
        require_all: Option<bool>,
    },
}

impl ReadSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContainsString { .. } => "contains_string",
            Self::ContainsAnyString { .. } => "contains_any_string",
            Self::ContainsLinesUnordered { .. } => "contains_lines_unordered",
        }
    }
}

/// Status/value/details selected when a check passes or fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTemplate {
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Option<TestStatus>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// Display and scheduling metadata of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckMetadata {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_true")]
    pub manual_only: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "lenient_status")]
    pub default_status: Option<TestStatus>,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub default_details: Option<String>,
    #[serde(default)]
    pub params: Vars,
}

impl Default for CheckMetadata {
    fn default() -> Self {
        Self {
            label: None,
            icon: None,
            manual_only: true,
            enabled: true,
            default_status: None,
            default_value: None,
            default_details: None,
            params: Vars::new(),
        }
    }
}

/// One named assertion inside a definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub read: Option<ReadSpec>,
    #[serde(default, rename = "pass")]
    pub on_pass: ResultTemplate,
    #[serde(default, rename = "fail")]
    pub on_fail: ResultTemplate,
    #[serde(default)]
    pub metadata: CheckMetadata,
}

/// Reusable command and check script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: DefinitionMode,
    #[serde(default)]
    pub execute: Vec<ExecuteStep>,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default)]
    pub params: Vars,
}

/// Remediation script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixDefinition {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub execute: Vec<ExecuteStep>,
    #[serde(default)]
    pub post_test_ids: Vec<String>,
    #[serde(default)]
    pub params: Vars,
}

// ============================================================================
// Helpers
// ============================================================================

fn default_true() -> bool {
    true
}

fn empty_list_ref() -> ValueRef<Vec<String>> {
    ValueRef::Literal(Vec::new())
}

/// Accept `true`, `"yes"`, `1` and friends. Unrecognised values fall back to
/// the caller's default.
fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| as_bool(&v)))
}

/// Unknown status labels degrade to a warning instead of failing the load.
fn lenient_status<'de, D>(deserializer: D) -> Result<Option<TestStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .filter(|label| !label.trim().is_empty())
        .map(|label| TestStatus::from_label(&label)))
}

pub(crate) fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Render a variable as text.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Non-empty trimmed strings of a JSON list.
pub fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| value_text(item).trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_spec_decodes_by_kind() {
        let spec: ReadSpec = serde_json::from_value(json!({
            "kind": "contains_lines_unordered",
            "inputRef": "topics",
            "lines": {"ref": "requiredTopics"},
            "requireAll": "no"
        }))
        .unwrap();
        match spec {
            ReadSpec::ContainsLinesUnordered {
                input,
                lines,
                require_all,
            } => {
                assert_eq!(input, ValueRef::Literal("topics".to_string()));
                assert_eq!(
                    lines,
                    ValueRef::Ref {
                        name: "requiredTopics".to_string()
                    }
                );
                assert_eq!(require_all, Some(false));
            }
            other => panic!("unexpected spec {other:?}"),
        }
    }

    #[test]
    fn test_unknown_read_kind_is_rejected() {
        let result: Result<ReadSpec, _> =
            serde_json::from_value(json!({"kind": "regex", "inputRef": "x"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_check_metadata_defaults() {
        let check: CheckSpec = serde_json::from_value(json!({"id": "general"})).unwrap();
        assert!(check.metadata.manual_only);
        assert!(check.metadata.enabled);
        assert!(check.read.is_none());
    }

    #[test]
    fn test_robot_port_defaults_to_22() {
        let robot: Robot = serde_json::from_value(json!({
            "id": "r1",
            "ip": "10.0.0.1",
            "type": "rover",
            "ssh": {"username": "u", "password": "p"}
        }))
        .unwrap();
        assert_eq!(robot.port(), 22);
        assert_eq!(robot.host, "10.0.0.1");
    }
}
