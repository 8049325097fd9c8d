//! Resolves a robot's tests and runs them as one batch.
//!
//! Tests that share a definition are grouped so each definition runs once
//! per batch; every check maps back to the test with the same id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use fleetd_protocol::{ReadVerdict, ResultSource, StepRecord, TestRunRaw, TestRunResult, TestStatus};
use log::{debug, info, warn};
use serde_json::Value;

use crate::catalog::{Catalog, CatalogHandle, DefinitionMode, RobotType, TestDefinition, TestEntry, Vars};
use crate::definitions::{NoEvents, Orchestrator, OutputCache, RunPlan};
use crate::error::{FleetError, FleetResult};
use crate::guard::ActivitySource;
use crate::probes::Reachability;
use crate::probes::reachability::{CONNECTIVITY_ERROR_CODE, unreachable};
use crate::runner::CommandRunner;
use crate::state::ONLINE_TEST_ID;

/// Type of `robot_id` in `catalog`.
pub(crate) fn robot_type_of<'c>(catalog: &'c Catalog, robot_id: &str) -> FleetResult<&'c RobotType> {
    let robot = catalog
        .robot(robot_id)
        .ok_or_else(|| FleetError::not_found(format!("Unknown robot id: {robot_id}")))?;
    let type_id = robot.type_id.trim();
    if type_id.is_empty() {
        return Err(FleetError::bad_request(format!(
            "Robot {robot_id} has no type configured"
        )));
    }
    catalog
        .robot_type(type_id)
        .ok_or_else(|| FleetError::not_found(format!("No robot type config found: {type_id}")))
}

/// Tests that share one definition run.
struct Group<'e> {
    definition: Arc<TestDefinition>,
    entries: Vec<&'e TestEntry>,
}

#[derive(Clone)]
pub struct TestExecutor {
    catalog: CatalogHandle,
    runner: CommandRunner,
    reachability: Reachability,
}

impl TestExecutor {
    pub fn new(catalog: CatalogHandle, runner: CommandRunner, reachability: Reachability) -> Self {
        Self {
            catalog,
            runner,
            reachability,
        }
    }

    /// Run the requested tests, or every manual test when `test_ids` is
    /// `None`.
    ///
    /// Per-test problems are results. Errors are reserved for an unknown
    /// robot or a request that selects nothing runnable.
    pub async fn run_tests(
        &self,
        robot_id: &str,
        client_session_id: &str,
        test_ids: Option<&[String]>,
        dry_run: bool,
    ) -> FleetResult<Vec<TestRunResult>> {
        let catalog = self.catalog.snapshot();
        let robot_type = robot_type_of(&catalog, robot_id)?;

        let requested = dedupe_ids(test_ids.unwrap_or_default());
        let requested_set: HashSet<&str> = requested.iter().map(String::as_str).collect();

        let mut matched = HashSet::new();
        let selected: Vec<&TestEntry> = robot_type
            .tests
            .iter()
            .filter(|entry| {
                if requested.is_empty() {
                    entry.manual_only
                } else if requested_set.contains(entry.id.as_str()) {
                    matched.insert(entry.id.clone());
                    true
                } else {
                    false
                }
            })
            .filter(|entry| entry.enabled)
            .collect();

        if selected.is_empty() {
            return Err(FleetError::bad_request(if requested.is_empty() {
                "No manual tests available for this robot type."
            } else {
                "No matching tests found for this robot type."
            }));
        }

        let mut results: Vec<TestRunResult> = requested
            .iter()
            .filter(|id| !matched.contains(*id))
            .map(|id| {
                TestRunResult::failure(
                    id.as_str(),
                    "invalid_test_id",
                    format!("Requested test id '{id}' is not configured for this robot type."),
                    "invalid_test_id",
                    ResultSource::Resolver,
                )
            })
            .collect();

        let run_scope = format!(
            "{robot_id}:{client_session_id}:{}",
            Utc::now().timestamp_millis()
        );
        info!(
            "Running {} test(s) on {robot_id} (dry_run={dry_run})",
            selected.len()
        );

        let outcome = self
            .execute(
                &catalog,
                robot_type,
                robot_id,
                client_session_id,
                &selected,
                &run_scope,
                dry_run,
            )
            .await;
        self.runner
            .sessions()
            .close(client_session_id, robot_id)
            .await;

        results.extend(outcome);
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        catalog: &Catalog,
        robot_type: &RobotType,
        robot_id: &str,
        client_session_id: &str,
        selected: &[&TestEntry],
        run_scope: &str,
        dry_run: bool,
    ) -> Vec<TestRunResult> {
        let mut by_id: HashMap<String, TestRunResult> = HashMap::new();
        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for &entry in selected {
            if entry.id == ONLINE_TEST_ID {
                let result = self.online_test(robot_id, &entry.id, dry_run).await;
                by_id.insert(entry.id.clone(), result);
                continue;
            }
            let Some(definition_id) = entry.definition_id.as_deref() else {
                by_id.insert(
                    entry.id.clone(),
                    TestRunResult::failure(
                        entry.id.as_str(),
                        "definition_not_set",
                        format!("Test '{}' has no definition configured.", entry.id),
                        "definition_not_set",
                        ResultSource::Resolver,
                    ),
                );
                continue;
            };
            let Some(definition) = catalog.definition(definition_id) else {
                by_id.insert(
                    entry.id.clone(),
                    TestRunResult::failure(
                        entry.id.as_str(),
                        "definition_not_found",
                        format!(
                            "Definition '{definition_id}' referenced by test '{}' was not found.",
                            entry.id
                        ),
                        "definition_not_found",
                        ResultSource::Resolver,
                    ),
                );
                continue;
            };
            if definition.mode == DefinitionMode::OnlineProbe {
                let result = self.online_test(robot_id, &entry.id, dry_run).await;
                by_id.insert(entry.id.clone(), result);
                continue;
            }
            match group_index.get(definition_id) {
                Some(idx) => groups[*idx].entries.push(entry),
                None => {
                    group_index.insert(definition_id.to_string(), groups.len());
                    groups.push(Group {
                        definition,
                        entries: vec![entry],
                    });
                }
            }
        }

        let orchestrator = Orchestrator::new(catalog.primitives());
        let exec = self
            .runner
            .bind(client_session_id, robot_id, ActivitySource::Manual);
        let mut cache = OutputCache::new();
        let mut aborted: Option<String> = None;

        for group in &groups {
            let definition_id = group.definition.id.as_str();
            if let Some(reason) = &aborted {
                for entry in &group.entries {
                    by_id.insert(entry.id.clone(), connectivity_failure(&entry.id, reason));
                }
                continue;
            }

            let plan = RunPlan {
                execute: &group.definition.execute,
                checks: &group.definition.checks,
                params: group_params(&group.definition, &group.entries, robot_type),
                run_scope,
                dry_run,
            };
            let started = Instant::now();
            let run = orchestrator.run(plan, &exec, &NoEvents, &mut cache).await;
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match run {
                Ok(run) => {
                    let raw = |read: Option<ReadVerdict>| TestRunRaw {
                        shared_execution_id: Some(format!("{run_scope}:{definition_id}")),
                        definition_id: Some(definition_id.to_string()),
                        step_count: run.steps.len(),
                        read,
                    };
                    for entry in &group.entries {
                        let result = match run.checks.get(&entry.id) {
                            Some(check) => TestRunResult {
                                id: entry.id.clone(),
                                status: check.status,
                                value: check.value.clone(),
                                details: check.details.clone(),
                                ms: elapsed,
                                source: None,
                                error_code: None,
                                steps: run.steps.clone(),
                                raw: Some(raw(check.read.clone())),
                            },
                            None => TestRunResult::failure(
                                entry.id.as_str(),
                                "definition_output_missing",
                                format!(
                                    "Definition '{definition_id}' did not produce output for test '{}'.",
                                    entry.id
                                ),
                                "definition_output_missing",
                                ResultSource::Executor,
                            ),
                        };
                        by_id.insert(entry.id.clone(), result);
                    }
                }
                Err(failure) => {
                    warn!(
                        "Definition '{definition_id}' failed on {robot_id}: {}",
                        failure.error
                    );
                    if failure.error.is_connectivity() {
                        let reason = failure.error.to_string();
                        for entry in &group.entries {
                            let mut result = connectivity_failure(&entry.id, &reason);
                            result.steps = failure.steps.clone();
                            by_id.insert(entry.id.clone(), result);
                        }
                        aborted = Some(reason);
                        continue;
                    }
                    for entry in &group.entries {
                        let mut result = TestRunResult::failure(
                            entry.id.as_str(),
                            "execution_error",
                            format!("Test execution failed: {}", failure.error),
                            "execution_error",
                            ResultSource::Executor,
                        );
                        result.ms = elapsed;
                        result.steps = failure.steps.clone();
                        by_id.insert(entry.id.clone(), result);
                    }
                }
            }
        }

        selected
            .iter()
            .filter_map(|entry| by_id.remove(&entry.id))
            .collect()
    }

    /// The `online` test is a reachability probe, not a definition run.
    async fn online_test(&self, robot_id: &str, test_id: &str, dry_run: bool) -> TestRunResult {
        if dry_run {
            return TestRunResult {
                id: test_id.to_string(),
                status: TestStatus::Warning,
                value: "pending".to_string(),
                details: "Dry-run mode: online check skipped.".to_string(),
                ms: 0,
                source: None,
                error_code: None,
                steps: Vec::new(),
                raw: None,
            };
        }

        let probe = match self.reachability.check_online(robot_id, None, false).await {
            Ok(probe) => probe,
            Err(err) => unreachable(robot_id, err.to_string()),
        };
        debug!("Online test for {robot_id}: {}", probe.status);
        TestRunResult {
            id: test_id.to_string(),
            status: probe.status,
            value: probe.value.clone(),
            details: probe.details.clone(),
            ms: probe.ms,
            source: Some(probe.source),
            error_code: probe.error_code.clone(),
            steps: vec![StepRecord {
                id: "connect".to_string(),
                status: probe.status,
                value: if probe.status.is_ok() {
                    "connected"
                } else {
                    "connect_failed"
                }
                .to_string(),
                details: probe.details,
                ms: probe.ms,
                output: String::new(),
                used_cache: false,
            }],
            raw: None,
        }
    }
}

fn connectivity_failure(test_id: &str, reason: &str) -> TestRunResult {
    TestRunResult::failure(
        test_id,
        CONNECTIVITY_ERROR_CODE,
        reason,
        CONNECTIVITY_ERROR_CODE,
        ResultSource::Executor,
    )
}

/// Variable scope for one definition run: definition params, then each
/// test's params in selection order.
fn group_params(definition: &TestDefinition, entries: &[&TestEntry], robot_type: &RobotType) -> Vars {
    let mut params = definition.params.clone();
    for entry in entries {
        for (key, value) in &entry.params {
            params.insert(key.clone(), value.clone());
        }
    }
    let has_topics = params
        .get("requiredTopics")
        .is_some_and(|value| matches!(value, Value::Array(items) if !items.is_empty()));
    if !has_topics && !robot_type.topics.is_empty() {
        params.insert(
            "requiredTopics".to_string(),
            Value::from(robot_type.topics.clone()),
        );
    }
    params
}

fn dedupe_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}
