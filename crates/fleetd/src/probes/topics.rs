//! Topic presence evaluation against a `rostopic list` snapshot.

use std::collections::{BTreeMap, BTreeSet};

use fleetd_protocol::TestStatus;
use serde_json::{Value, json};

use crate::catalog::{RobotType, value_text};
use crate::state::{BATTERY_TEST_ID, ONLINE_TEST_ID};

/// A test whose result is derived from the topic snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTest {
    pub id: String,
    pub required_topics: Vec<String>,
    pub namespace: String,
}

/// Enabled tests of `robot_type` that declare `requiredTopics`.
pub fn topic_tests(robot_type: &RobotType) -> Vec<TopicTest> {
    robot_type
        .tests
        .iter()
        .filter(|entry| entry.enabled)
        .filter(|entry| entry.id != ONLINE_TEST_ID && entry.id != BATTERY_TEST_ID)
        .filter_map(|entry| {
            let required_topics = entry.required_topics();
            if required_topics.is_empty() {
                return None;
            }
            Some(TopicTest {
                id: entry.id.clone(),
                required_topics,
                namespace: entry
                    .params
                    .get("namespace")
                    .map(value_text)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
            })
        })
        .collect()
}

/// Outcome for one topic test.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicsPresence {
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    /// Structured summary of what was compared.
    pub output: Value,
}

/// Compare the listed topics with `expected`.
///
/// A missing topic still counts as present when a namespaced variant such
/// as `/robot1/scan` is listed for `/scan`.
pub fn parse_topics_presence(raw_output: &str, expected: &[String], namespace: &str) -> TopicsPresence {
    let present: BTreeSet<String> = raw_output
        .replace('\r', "")
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('/'))
        .map(str::to_string)
        .collect();
    let expected: BTreeSet<String> = expected
        .iter()
        .map(|topic| topic.trim().to_string())
        .filter(|topic| !topic.is_empty())
        .collect();

    let mut expected_namespace = namespace.trim().to_string();
    if !expected_namespace.is_empty() && !expected_namespace.starts_with('/') {
        expected_namespace.insert(0, '/');
    }

    let mut matched_by_namespace: BTreeMap<String, String> = BTreeMap::new();
    let mut detected: BTreeSet<String> = BTreeSet::new();
    for topic in expected.iter().filter(|topic| !present.contains(*topic)) {
        for listed in &present {
            if listed == topic || !listed.ends_with(topic.as_str()) {
                continue;
            }
            let prefix = &listed[..listed.len() - topic.len()];
            let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
            if !prefix.starts_with('/') || prefix == "/" {
                continue;
            }
            matched_by_namespace.insert(topic.clone(), listed.clone());
            detected.insert(prefix.to_string());
            break;
        }
    }

    let mut namespace_present = false;
    if !expected_namespace.is_empty() {
        let nested = format!("{expected_namespace}/");
        namespace_present = present
            .iter()
            .any(|listed| *listed == expected_namespace || listed.starts_with(&nested));
        if namespace_present {
            detected.insert(expected_namespace.clone());
        }
    }
    if !matched_by_namespace.is_empty() {
        namespace_present = true;
    }

    let missing: Vec<String> = expected
        .iter()
        .filter(|topic| !present.contains(*topic) && !matched_by_namespace.contains_key(*topic))
        .cloned()
        .collect();

    let mut output = json!({
        "expectedTopics": expected,
        "presentTopics": present,
        "namespace": expected_namespace,
        "namespacePresent": namespace_present,
        "detectedNamespaces": detected,
        "matchedByNamespace": matched_by_namespace,
    });
    let namespaces = detected.iter().cloned().collect::<Vec<_>>().join(", ");

    if expected.is_empty() {
        return TopicsPresence {
            status: TestStatus::Warning,
            value: "no_expected_topics".to_string(),
            details: "Robot type does not define required topics.".to_string(),
            output,
        };
    }

    if !missing.is_empty() {
        let mut details = format!("Missing topics: {}", missing.join(", "));
        if !detected.is_empty() {
            details.push_str(&format!(". Namespace(s) detected: {namespaces}"));
        }
        output["missingTopics"] = json!(missing);
        return TopicsPresence {
            status: TestStatus::Error,
            value: "missing".to_string(),
            details,
            output,
        };
    }

    let mut details = "All required topics present".to_string();
    if !detected.is_empty() {
        details.push_str(&format!(". Namespace(s) detected: {namespaces}"));
    } else if !expected_namespace.is_empty() {
        details.push_str(&format!(". Namespace '{expected_namespace}' not found."));
    }
    TopicsPresence {
        status: TestStatus::Ok,
        value: "all_present".to_string(),
        details,
        output,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_all_present() {
        let result = parse_topics_presence("/odom\r\n/scan\nWARNING: x\n", &topics(&["/scan", "/odom"]), "");
        assert_eq!(result.status, TestStatus::Ok);
        assert_eq!(result.details, "All required topics present");
        assert_eq!(result.output["presentTopics"], json!(["/odom", "/scan"]));
    }

    #[test]
    fn test_missing_topics() {
        let result = parse_topics_presence("/odom\n", &topics(&["/scan", "/imu", "/odom"]), "");
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.value, "missing");
        assert_eq!(result.details, "Missing topics: /imu, /scan");
        assert_eq!(result.output["missingTopics"], json!(["/imu", "/scan"]));
    }

    #[test]
    fn test_namespaced_variant_counts() {
        let result = parse_topics_presence("/robot1/scan\n/robot1/odom\n", &topics(&["/scan", "/odom"]), "");
        assert_eq!(result.status, TestStatus::Ok);
        assert_eq!(result.details, "All required topics present. Namespace(s) detected: /robot1");
        assert_eq!(result.output["matchedByNamespace"]["/scan"], json!("/robot1/scan"));
    }

    #[test]
    fn test_expected_namespace_not_found() {
        let result = parse_topics_presence("/scan\n", &topics(&["/scan"]), "robot7");
        assert_eq!(result.details, "All required topics present. Namespace '/robot7' not found.");
        assert_eq!(result.output["namespace"], json!("/robot7"));
    }

    #[test]
    fn test_no_expected_topics() {
        let result = parse_topics_presence("/scan\n", &[], "");
        assert_eq!(result.status, TestStatus::Warning);
        assert_eq!(result.value, "no_expected_topics");
    }
}
