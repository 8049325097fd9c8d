//! Load a catalog from a directory of JSON documents.
//!
//! Layout:
//!
//! ```text
//! <dir>/robots.json                      list, or {"robots": [...]} / {"fleet": [...]}
//! <dir>/robot-types.json                 list, or {"robotTypes": [...]}
//! <dir>/command-primitives/*.command.json
//! <dir>/tests/*.test.json
//! <dir>/fixes/*.fix.json
//! ```
//!
//! Missing files and directories are treated as empty.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{Catalog, CatalogDocuments, CatalogError};

pub const ROBOTS_FILE: &str = "robots.json";
pub const ROBOT_TYPES_FILE: &str = "robot-types.json";
pub const PRIMITIVES_DIR: &str = "command-primitives";
pub const TESTS_DIR: &str = "tests";
pub const FIXES_DIR: &str = "fixes";

/// Read and validate the catalog stored under `dir`.
pub fn load_catalog(dir: &Path) -> Result<Catalog, CatalogError> {
    let docs = load_documents(dir)?;
    let catalog = Catalog::from_documents(docs)?;
    info!(
        "Loaded catalog from {}: {} robot(s)",
        dir.display(),
        catalog.robots().len()
    );
    Ok(catalog)
}

/// Read the raw documents stored under `dir` without validating them.
pub fn load_documents(dir: &Path) -> Result<CatalogDocuments, CatalogError> {
    let robots = match read_json(&dir.join(ROBOTS_FILE))? {
        Some(value) => {
            let path = dir.join(ROBOTS_FILE);
            let list = unwrap_list(value, &["robots", "fleet"]);
            decode(&path, list)?
        }
        None => Vec::new(),
    };

    let robot_types = match read_json(&dir.join(ROBOT_TYPES_FILE))? {
        Some(value) => {
            let path = dir.join(ROBOT_TYPES_FILE);
            let list = unwrap_list(value, &["robotTypes"]);
            decode(&path, list)?
        }
        None => Vec::new(),
    };

    Ok(CatalogDocuments {
        robots,
        robot_types,
        command_primitives: load_definition_dir(&dir.join(PRIMITIVES_DIR), ".command.json")?,
        tests: load_definition_dir(&dir.join(TESTS_DIR), ".test.json")?,
        fixes: load_definition_dir(&dir.join(FIXES_DIR), ".fix.json")?,
    })
}

fn read_json(path: &Path) -> Result<Option<Value>, CatalogError> {
    if !path.exists() {
        debug!("Catalog file {} not present", path.display());
        return Ok(None);
    }
    let body = fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&body)
        .map(Some)
        .map_err(|source| CatalogError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn decode<T: DeserializeOwned>(path: &Path, value: Value) -> Result<T, CatalogError> {
    serde_json::from_value(value).map_err(|source| CatalogError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Accept either a bare list or an object wrapping the list under one of `keys`.
fn unwrap_list(value: Value, keys: &[&str]) -> Value {
    match value {
        Value::Array(_) => value,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(list @ Value::Array(_)) => Some(list),
                _ => None,
            })
            .unwrap_or_else(|| Value::Array(Vec::new())),
        _ => Value::Array(Vec::new()),
    }
}

fn load_definition_dir<T: DeserializeOwned>(dir: &Path, suffix: &str) -> Result<Vec<T>, CatalogError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|source| CatalogError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(suffix))
        })
        .collect();
    paths.sort();

    let mut out = Vec::with_capacity(paths.len());
    for path in paths {
        let Some(value) = read_json(&path)? else {
            continue;
        };
        if !value.is_object() {
            return Err(CatalogError::Invalid(format!(
                "Definition file '{}' must contain a JSON object",
                path.display()
            )));
        }
        out.push(decode(&path, value)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, value: Value) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn test_loads_directory_layout() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join(ROBOTS_FILE),
            json!({"robots": [{"id": "r1", "ip": "10.0.0.1", "type": "rover"}]}),
        );
        write(
            &root.join(ROBOT_TYPES_FILE),
            json!([{"id": "rover", "testRefs": ["general"]}]),
        );
        write(
            &root.join(PRIMITIVES_DIR).join("list.command.json"),
            json!({"id": "list", "command": "ls"}),
        );
        write(
            &root.join(TESTS_DIR).join("base.test.json"),
            json!({
                "id": "base",
                "execute": [{"command": "$list$", "saveAs": "out"}],
                "checks": [{"id": "general", "read": {"kind": "contains_string", "inputRef": "out", "needle": "x"}}]
            }),
        );
        write(&root.join(TESTS_DIR).join("notes.txt"), json!("ignored"));

        let catalog = load_catalog(root).unwrap();
        assert_eq!(catalog.robot_ids(), vec!["r1".to_string()]);
        assert!(catalog.definition("base").is_some());
        assert!(catalog.primitives().contains_key("list"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = load_catalog(&dir.path().join("absent")).unwrap();
        assert!(catalog.robots().is_empty());
    }

    #[test]
    fn test_non_object_definition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join(TESTS_DIR).join("bad.test.json"), json!([1, 2]));
        let err = load_catalog(dir.path()).unwrap_err();
        assert!(err.to_string().contains("must contain a JSON object"));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ROBOTS_FILE), "{not json").unwrap();
        let err = load_catalog(dir.path()).unwrap_err();
        assert!(matches!(err, CatalogError::Parse { .. }));
        assert!(err.to_string().contains(ROBOTS_FILE));
    }
}
