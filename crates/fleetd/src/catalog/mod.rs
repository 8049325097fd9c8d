//! Robot, robot type and definition catalog.
//!
//! The catalog is built once from raw documents and validated as a whole.
//! Afterwards it is immutable; a reload builds a new catalog and swaps it in
//! through [`CatalogHandle`].

pub mod loader;
mod model;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fleetd_protocol::TestStatus;
use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use model::{
    CheckMetadata, CheckSpec, CommandPrimitive, DEFAULT_SSH_PORT, DefinitionMode, ExecuteStep,
    FixDefinition, FixEntry, ReadSpec, ResultTemplate, Robot, RobotType, SshCredentials,
    TestDefinition, TestEntry, ValueRef, Vars, string_list, value_text,
};

/// A command consisting only of `$name$` refers to a command primitive.
static PRIMITIVE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$([A-Za-z0-9_.-]+)\$$").expect("valid primitive token pattern"));

/// Primitive id referenced by a command, if the command is a bare token.
pub fn primitive_token(command: &str) -> Option<&str> {
    PRIMITIVE_TOKEN
        .captures(command.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Errors raised while loading or validating a catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> CatalogError {
    CatalogError::Invalid(msg.into())
}

// ============================================================================
// Raw documents
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoMonitorDocument {
    #[serde(default)]
    pub battery_command: Option<String>,
}

/// Robot type as written by operators, before references are resolved.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotTypeDocument {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub test_refs: Vec<String>,
    #[serde(default)]
    pub fix_refs: Vec<String>,
    #[serde(default)]
    pub test_overrides: HashMap<String, Vars>,
    #[serde(default)]
    pub fix_overrides: HashMap<String, Vars>,
    #[serde(default)]
    pub auto_monitor: AutoMonitorDocument,
}

/// Everything a catalog is built from.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDocuments {
    #[serde(default)]
    pub robots: Vec<Robot>,
    #[serde(default)]
    pub robot_types: Vec<RobotTypeDocument>,
    #[serde(default)]
    pub command_primitives: Vec<CommandPrimitive>,
    #[serde(default)]
    pub tests: Vec<TestDefinition>,
    #[serde(default)]
    pub fixes: Vec<FixDefinition>,
}

// ============================================================================
// Catalog
// ============================================================================

/// Validated, immutable catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    robots: Vec<Robot>,
    robot_index: HashMap<String, usize>,
    robot_types: HashMap<String, RobotType>,
    primitives: HashMap<String, CommandPrimitive>,
    definitions: HashMap<String, Arc<TestDefinition>>,
    check_index: HashMap<String, String>,
    fixes: HashMap<String, FixDefinition>,
}

impl Catalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate documents and resolve every cross reference.
    pub fn from_documents(docs: CatalogDocuments) -> Result<Self, CatalogError> {
        let mut primitives = HashMap::new();
        for primitive in docs.command_primitives {
            let id = primitive.id.trim().to_string();
            if id.is_empty() {
                return Err(invalid("Command primitive is missing id"));
            }
            if primitive.command.trim().is_empty() {
                return Err(invalid(format!("Command primitive '{id}' has empty command")));
            }
            if primitives.contains_key(&id) {
                return Err(invalid(format!("Duplicate command primitive id '{id}'")));
            }
            primitives.insert(id.clone(), CommandPrimitive { id, ..primitive });
        }

        let mut definitions = HashMap::new();
        let mut check_index = HashMap::new();
        for definition in docs.tests {
            let definition = normalize_definition(definition)?;
            if definitions.contains_key(&definition.id) {
                return Err(invalid(format!(
                    "Duplicate test definition id '{}'",
                    definition.id
                )));
            }
            for check in &definition.checks {
                if check_index.contains_key(&check.id) {
                    return Err(invalid(format!("Duplicate check id '{}'", check.id)));
                }
                check_index.insert(check.id.clone(), definition.id.clone());
            }
            definitions.insert(definition.id.clone(), Arc::new(definition));
        }

        let mut fixes = HashMap::new();
        for fix in docs.fixes {
            let fix = normalize_fix(fix)?;
            if fixes.contains_key(&fix.id) {
                return Err(invalid(format!("Duplicate fix definition id '{}'", fix.id)));
            }
            fixes.insert(fix.id.clone(), fix);
        }

        for definition in definitions.values() {
            validate_primitive_refs("Test definition", &definition.id, &definition.execute, &primitives)?;
        }
        for fix in fixes.values() {
            validate_primitive_refs("Fix definition", &fix.id, &fix.execute, &primitives)?;
        }

        let mut robots = Vec::new();
        let mut robot_index = HashMap::new();
        for mut robot in docs.robots {
            robot.id = robot.id.trim().to_string();
            if robot.id.is_empty() {
                warn!("Skipping robot without id");
                continue;
            }
            if robot_index.contains_key(&robot.id) {
                return Err(invalid(format!("Duplicate robot id '{}'", robot.id)));
            }
            robot_index.insert(robot.id.clone(), robots.len());
            robots.push(robot);
        }

        let mut catalog = Self {
            robots,
            robot_index,
            robot_types: HashMap::new(),
            primitives,
            definitions,
            check_index,
            fixes,
        };

        for doc in docs.robot_types {
            if let Some(robot_type) = catalog.resolve_robot_type(doc)? {
                catalog
                    .robot_types
                    .insert(robot_type.key.clone(), robot_type);
            }
        }

        Ok(catalog)
    }

    pub fn robots(&self) -> &[Robot] {
        &self.robots
    }

    pub fn robot_ids(&self) -> Vec<String> {
        self.robots.iter().map(|robot| robot.id.clone()).collect()
    }

    pub fn robot(&self, robot_id: &str) -> Option<&Robot> {
        self.robot_index
            .get(robot_id)
            .and_then(|idx| self.robots.get(*idx))
    }

    pub fn robot_type(&self, type_id: &str) -> Option<&RobotType> {
        self.robot_types.get(&type_id.trim().to_lowercase())
    }

    /// Type of a known robot.
    pub fn robot_type_for(&self, robot_id: &str) -> Option<&RobotType> {
        self.robot(robot_id)
            .and_then(|robot| self.robot_type(&robot.type_id))
    }

    pub fn primitives(&self) -> &HashMap<String, CommandPrimitive> {
        &self.primitives
    }

    pub fn definition(&self, definition_id: &str) -> Option<Arc<TestDefinition>> {
        self.definitions.get(definition_id).cloned()
    }

    /// Definition that declares `check_id`.
    pub fn definition_for_check(&self, check_id: &str) -> Option<Arc<TestDefinition>> {
        self.check_index
            .get(check_id)
            .and_then(|definition_id| self.definition(definition_id))
    }

    pub fn fix_definition(&self, fix_id: &str) -> Option<&FixDefinition> {
        self.fixes.get(fix_id)
    }

    fn resolve_robot_type(&self, doc: RobotTypeDocument) -> Result<Option<RobotType>, CatalogError> {
        let type_id = doc
            .id
            .as_deref()
            .or(doc.name.as_deref())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if type_id.is_empty() {
            warn!("Skipping robot type without id or name");
            return Ok(None);
        }

        let topics = doc
            .topics
            .iter()
            .map(|topic| topic.trim().to_string())
            .filter(|topic| !topic.is_empty())
            .collect();

        let empty = Vars::new();
        let mut tests = Vec::new();
        for test_id in dedupe(&doc.test_refs) {
            let overrides = doc.test_overrides.get(&test_id).unwrap_or(&empty);
            tests.push(self.resolve_test_entry(&type_id, &test_id, overrides));
        }

        let mut fixes = Vec::new();
        for fix_id in dedupe(&doc.fix_refs) {
            let Some(definition) = self.fixes.get(&fix_id) else {
                return Err(invalid(format!(
                    "Robot type '{type_id}' references unknown fix id '{fix_id}'"
                )));
            };
            let overrides = doc.fix_overrides.get(&fix_id).unwrap_or(&empty);
            let fix = resolve_fix_entry(definition, overrides)?;
            for post_test_id in &fix.post_test_ids {
                if !self.check_index.contains_key(post_test_id) {
                    return Err(invalid(format!(
                        "Fix '{fix_id}' references unknown postTestId '{post_test_id}' in robot type '{type_id}'"
                    )));
                }
            }
            fixes.push(fix);
        }

        let battery_command = doc
            .auto_monitor
            .battery_command
            .map(|command| command.trim().to_string())
            .filter(|command| !command.is_empty());

        Ok(Some(RobotType {
            key: type_id.to_lowercase(),
            label: doc
                .name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| type_id.clone()),
            id: type_id,
            topics,
            tests,
            fixes,
            battery_command,
        }))
    }

    fn resolve_test_entry(&self, type_id: &str, test_id: &str, overrides: &Vars) -> TestEntry {
        let owner = self.definition_for_check(test_id);
        let check = owner
            .as_ref()
            .and_then(|definition| definition.checks.iter().find(|c| c.id == test_id));
        if check.is_none() {
            warn!("Robot type '{type_id}' references test '{test_id}' which no definition declares");
        }
        let metadata = check.map(|c| c.metadata.clone()).unwrap_or_default();

        let definition_id = text(overrides.get("definitionId"))
            .or_else(|| owner.as_ref().map(|d| d.id.clone()));

        let mut params = metadata.params.clone();
        merge_params(&mut params, overrides, TEST_RESERVED_KEYS);

        TestEntry {
            id: test_id.to_string(),
            definition_id,
            label: text(overrides.get("label"))
                .or(metadata.label)
                .or_else(|| check.and_then(|c| c.label.clone()))
                .unwrap_or_else(|| test_id.to_string()),
            icon: text(overrides.get("icon"))
                .or(metadata.icon)
                .unwrap_or_else(|| DEFAULT_ICON.to_string()),
            manual_only: overrides
                .get("manualOnly")
                .and_then(model::as_bool)
                .unwrap_or(metadata.manual_only),
            enabled: overrides
                .get("enabled")
                .and_then(model::as_bool)
                .unwrap_or(metadata.enabled),
            default_status: text(overrides.get("defaultStatus"))
                .map(|label| TestStatus::from_label(&label))
                .or(metadata.default_status)
                .unwrap_or(TestStatus::Warning),
            default_value: text(overrides.get("defaultValue"))
                .or(metadata.default_value)
                .unwrap_or_else(|| "unknown".to_string()),
            default_details: text(overrides.get("defaultDetails"))
                .or(metadata.default_details)
                .unwrap_or_else(|| "Not checked yet".to_string()),
            params,
        }
    }
}

const DEFAULT_ICON: &str = "⚙️";

const TEST_RESERVED_KEYS: &[&str] = &[
    "label",
    "icon",
    "enabled",
    "manualOnly",
    "defaultStatus",
    "defaultValue",
    "defaultDetails",
    "possibleResults",
    "params",
    "definitionId",
];

const FIX_RESERVED_KEYS: &[&str] = &[
    "label",
    "description",
    "enabled",
    "params",
    "postTestIds",
    "execute",
];

/// Overlay `overrides.params` and every non-reserved override key.
fn merge_params(params: &mut Vars, overrides: &Vars, reserved: &[&str]) {
    if let Some(Value::Object(extra)) = overrides.get("params") {
        for (key, value) in extra {
            params.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in overrides {
        if !reserved.contains(&key.as_str()) {
            params.insert(key.clone(), value.clone());
        }
    }
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .map(value_text)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

fn normalize_steps(owner: &str, steps: Vec<ExecuteStep>) -> Result<Vec<ExecuteStep>, CatalogError> {
    steps
        .into_iter()
        .enumerate()
        .map(|(index, mut step)| {
            if step.id.trim().is_empty() {
                step.id = format!("step-{}", index + 1);
            }
            if let ValueRef::Literal(command) = &step.command {
                if command.trim().is_empty() {
                    return Err(invalid(format!(
                        "{owner} step '{}' has empty command",
                        step.id
                    )));
                }
            }
            Ok(step)
        })
        .collect()
}

fn normalize_definition(mut definition: TestDefinition) -> Result<TestDefinition, CatalogError> {
    definition.id = definition.id.trim().to_string();
    if definition.id.is_empty() {
        return Err(invalid("Test definition is missing id"));
    }
    let id = definition.id.clone();

    if definition.mode == DefinitionMode::Orchestrate && definition.execute.is_empty() {
        return Err(invalid(format!(
            "Test definition '{id}' must define non-empty execute[]"
        )));
    }
    if definition.checks.is_empty() {
        return Err(invalid(format!(
            "Test definition '{id}' must define non-empty checks[]"
        )));
    }

    let mut local = HashSet::new();
    for check in &mut definition.checks {
        check.id = check.id.trim().to_string();
        if check.id.is_empty() {
            return Err(invalid(format!("Test definition '{id}' has check without id")));
        }
        if !local.insert(check.id.clone()) {
            return Err(invalid(format!(
                "Test definition '{id}' has duplicate check id '{}'",
                check.id
            )));
        }
        if definition.mode == DefinitionMode::Orchestrate && check.read.is_none() {
            return Err(invalid(format!(
                "Test definition '{id}' check '{}' has no read predicate",
                check.id
            )));
        }
    }

    definition.execute = normalize_steps(&format!("Test definition '{id}'"), definition.execute)?;
    Ok(definition)
}

fn normalize_fix(mut fix: FixDefinition) -> Result<FixDefinition, CatalogError> {
    fix.id = fix.id.trim().to_string();
    if fix.id.is_empty() {
        return Err(invalid("Fix definition is missing id"));
    }
    if fix.execute.is_empty() {
        return Err(invalid(format!(
            "Fix definition '{}' must define non-empty execute[]",
            fix.id
        )));
    }
    fix.execute = normalize_steps(&format!("Fix definition '{}'", fix.id), fix.execute)?;
    fix.post_test_ids = dedupe(&fix.post_test_ids);
    Ok(fix)
}

fn validate_primitive_refs(
    owner_kind: &str,
    owner_id: &str,
    steps: &[ExecuteStep],
    primitives: &HashMap<String, CommandPrimitive>,
) -> Result<(), CatalogError> {
    for step in steps {
        if let ValueRef::Literal(command) = &step.command {
            if let Some(token) = primitive_token(command) {
                if !primitives.contains_key(token) {
                    return Err(invalid(format!(
                        "{owner_kind} '{owner_id}' references unknown command primitive '{token}'"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn resolve_fix_entry(definition: &FixDefinition, overrides: &Vars) -> Result<FixEntry, CatalogError> {
    let mut params = definition.params.clone();
    merge_params(&mut params, overrides, FIX_RESERVED_KEYS);

    let post_test_ids = match overrides.get("postTestIds") {
        Some(value @ Value::Array(_)) => string_list(Some(value)),
        _ => definition.post_test_ids.clone(),
    };

    let execute = match overrides.get("execute") {
        Some(Value::Array(steps)) => {
            let steps: Vec<ExecuteStep> = serde_json::from_value(Value::Array(steps.clone()))
                .map_err(|e| {
                    invalid(format!(
                        "Fix override for '{}' has invalid execute[]: {e}",
                        definition.id
                    ))
                })?;
            normalize_steps(&format!("Fix definition '{}'", definition.id), steps)?
        }
        _ => definition.execute.clone(),
    };

    Ok(FixEntry {
        id: definition.id.clone(),
        label: text(overrides.get("label"))
            .or_else(|| definition.label.clone())
            .unwrap_or_else(|| definition.id.clone()),
        description: text(overrides.get("description"))
            .unwrap_or_else(|| definition.description.clone()),
        enabled: overrides
            .get("enabled")
            .and_then(model::as_bool)
            .unwrap_or(definition.enabled),
        params,
        post_test_ids,
        execute,
    })
}

// ============================================================================
// Handle
// ============================================================================

/// Shared, atomically replaceable catalog.
#[derive(Debug, Clone, Default)]
pub struct CatalogHandle {
    current: Arc<RwLock<Arc<Catalog>>>,
}

impl CatalogHandle {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(catalog))),
        }
    }

    /// Consistent view of the catalog at this moment.
    pub fn snapshot(&self) -> Arc<Catalog> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a new catalog. Holders of older snapshots keep theirs.
    pub fn replace(&self, catalog: Catalog) {
        let catalog = Arc::new(catalog);
        match self.current.write() {
            Ok(mut guard) => *guard = catalog,
            Err(poisoned) => *poisoned.into_inner() = catalog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn documents(value: Value) -> CatalogDocuments {
        serde_json::from_value(value).unwrap()
    }

    fn base() -> Value {
        json!({
            "robots": [
                {"id": "r1", "ip": "10.0.0.1", "type": "Rover", "ssh": {"username": "u", "password": "p"}}
            ],
            "robotTypes": [
                {
                    "id": "Rover",
                    "topics": ["/odom", " "],
                    "testRefs": ["online", "general", "general", "ghost"],
                    "fixRefs": ["restart"],
                    "testOverrides": {"general": {"label": "General", "requiredTopics": ["/odom"]}},
                    "autoMonitor": {"batteryCommand": "cat /sys/battery"}
                }
            ],
            "commandPrimitives": [
                {"id": "topics", "command": "rostopic list", "timeoutSec": 5}
            ],
            "tests": [
                {
                    "id": "connectivity",
                    "mode": "online_probe",
                    "checks": [{"id": "online"}]
                },
                {
                    "id": "base",
                    "execute": [{"command": "$topics$", "saveAs": "topics", "reuseKey": "topics"}],
                    "checks": [
                        {
                            "id": "general",
                            "read": {"kind": "contains_string", "inputRef": "topics", "needle": "/odom"},
                            "metadata": {"manualOnly": true, "params": {"a": 1}}
                        }
                    ]
                }
            ],
            "fixes": [
                {"id": "restart", "execute": [{"command": "sudo systemctl restart ros"}], "postTestIds": ["general"]}
            ]
        })
    }

    #[test]
    fn test_builds_valid_catalog() {
        let catalog = Catalog::from_documents(documents(base())).unwrap();
        let robot_type = catalog.robot_type_for("r1").unwrap();

        assert_eq!(robot_type.key, "rover");
        assert_eq!(robot_type.topics, vec!["/odom".to_string()]);
        assert_eq!(robot_type.battery_command.as_deref(), Some("cat /sys/battery"));

        let ids: Vec<&str> = robot_type.tests.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["online", "general", "ghost"]);

        let general = robot_type.test("general").unwrap();
        assert_eq!(general.label, "General");
        assert_eq!(general.definition_id.as_deref(), Some("base"));
        assert_eq!(general.params["a"], json!(1));
        assert_eq!(general.required_topics(), vec!["/odom".to_string()]);

        let ghost = robot_type.test("ghost").unwrap();
        assert!(ghost.definition_id.is_none());
        assert_eq!(ghost.default_value, "unknown");

        let base = catalog.definition("base").unwrap();
        assert_eq!(base.execute[0].id, "step-1");
        assert_eq!(robot_type.fix("restart").unwrap().post_test_ids, vec!["general"]);
    }

    #[test]
    fn test_rejects_duplicate_check_ids_across_definitions() {
        let mut docs = base();
        docs["tests"].as_array_mut().unwrap().push(json!({
            "id": "other",
            "execute": [{"command": "true"}],
            "checks": [{"id": "general", "read": {"kind": "contains_string", "inputRef": "x", "needle": "y"}}]
        }));
        let err = Catalog::from_documents(documents(docs)).unwrap_err();
        assert!(err.to_string().contains("Duplicate check id 'general'"));
    }

    #[test]
    fn test_rejects_unknown_primitive_token() {
        let mut docs = base();
        docs["commandPrimitives"] = json!([]);
        let err = Catalog::from_documents(documents(docs)).unwrap_err();
        assert!(err.to_string().contains("unknown command primitive 'topics'"));
    }

    #[test]
    fn test_rejects_orchestrate_without_steps() {
        let mut docs = base();
        docs["tests"][1]["execute"] = json!([]);
        let err = Catalog::from_documents(documents(docs)).unwrap_err();
        assert!(err.to_string().contains("non-empty execute"));
    }

    #[test]
    fn test_rejects_unknown_post_test_id() {
        let mut docs = base();
        docs["fixes"][0]["postTestIds"] = json!(["nope"]);
        let err = Catalog::from_documents(documents(docs)).unwrap_err();
        assert!(err.to_string().contains("unknown postTestId 'nope'"));
    }

    #[test]
    fn test_fix_override_replaces_post_tests() {
        let mut docs = base();
        docs["robotTypes"][0]["fixOverrides"] =
            json!({"restart": {"postTestIds": [], "enabled": false, "delay": 5}});
        let catalog = Catalog::from_documents(documents(docs)).unwrap();
        let fix = catalog.robot_type("rover").unwrap().fix("restart").unwrap();
        assert!(fix.post_test_ids.is_empty());
        assert!(!fix.enabled);
        assert_eq!(fix.params["delay"], json!(5));
    }

    #[test]
    fn test_primitive_token() {
        assert_eq!(primitive_token("$topics$"), Some("topics"));
        assert_eq!(primitive_token("echo $HOME$"), None);
        assert_eq!(primitive_token("rostopic list"), None);
    }

    #[test]
    fn test_handle_swaps_atomically() {
        let handle = CatalogHandle::new(Catalog::empty());
        let before = handle.snapshot();
        handle.replace(Catalog::from_documents(documents(base())).unwrap());
        assert!(before.robot("r1").is_none());
        assert!(handle.snapshot().robot("r1").is_some());
    }
}
