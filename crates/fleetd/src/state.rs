//! In-memory runtime state: latest test results, activity flags and the
//! reachability snapshot of every robot.
//!
//! Results are merged, never blindly overwritten. See [`should_replace`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use fleetd_protocol::{
    ActivityPhase, ReachabilityResult, ResultSource, RuntimeActivity, RuntimeTestResult,
    TestRunResult, TestStatus,
};
use log::debug;

/// Test id of the reachability result.
pub const ONLINE_TEST_ID: &str = "online";

/// Test id of the battery result.
pub const BATTERY_TEST_ID: &str = "battery";

/// Whether `incoming` should replace `current`.
///
/// Strictly newer always wins. On an exact timestamp tie the higher or equal
/// source rank wins, so a background probe cannot clobber a manual result
/// taken at the same instant.
pub fn should_replace(current: Option<&RuntimeTestResult>, incoming: &RuntimeTestResult) -> bool {
    let Some(current) = current else {
        return true;
    };
    if incoming.checked_at != current.checked_at {
        return incoming.checked_at > current.checked_at;
    }
    incoming.source.rank() >= current.source.rank()
}

/// Partial activity update. `None` leaves a field untouched; `phase:
/// Some(None)` clears the phase explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActivityUpdate {
    pub searching: Option<bool>,
    pub testing: Option<bool>,
    pub phase: Option<Option<ActivityPhase>>,
}

impl ActivityUpdate {
    pub fn searching(searching: bool) -> Self {
        Self {
            searching: Some(searching),
            ..Self::default()
        }
    }

    pub fn testing(testing: bool) -> Self {
        Self {
            testing: Some(testing),
            ..Self::default()
        }
    }

    pub fn with_phase(mut self, phase: Option<ActivityPhase>) -> Self {
        self.phase = Some(phase);
        self
    }
}

#[derive(Debug, Default)]
struct StateInner {
    results: HashMap<String, HashMap<String, RuntimeTestResult>>,
    activity: HashMap<String, RuntimeActivity>,
    reachability: HashMap<String, ReachabilityResult>,
}

/// Shared runtime state. Cloning shares the same store.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStateStore {
    inner: Arc<Mutex<StateInner>>,
}

impl RuntimeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Merge `updates` into the robot's results. Returns the ids that were
    /// applied.
    pub fn record_results<I>(&self, robot_id: &str, updates: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, RuntimeTestResult)>,
    {
        let mut state = self.lock();
        let results = state.results.entry(robot_id.to_string()).or_default();
        let mut applied = Vec::new();
        for (test_id, incoming) in updates {
            if !should_replace(results.get(&test_id), &incoming) {
                debug!("Dropping older result for {robot_id}/{test_id}");
                continue;
            }
            results.insert(test_id.clone(), incoming);
            applied.push(test_id);
        }

        let online = results.get(ONLINE_TEST_ID).cloned();
        if let Some(online) = online.filter(|_| applied.iter().any(|id| id == ONLINE_TEST_ID)) {
            state
                .reachability
                .insert(robot_id.to_string(), snapshot_from_runtime(robot_id, &online));
        }
        applied
    }

    pub fn record_result(&self, robot_id: &str, test_id: &str, result: RuntimeTestResult) -> bool {
        !self
            .record_results(robot_id, [(test_id.to_string(), result)])
            .is_empty()
    }

    /// Copy of the robot's results.
    pub fn get_results(&self, robot_id: &str) -> HashMap<String, RuntimeTestResult> {
        self.lock()
            .results
            .get(robot_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_result(&self, robot_id: &str, test_id: &str) -> Option<RuntimeTestResult> {
        self.lock()
            .results
            .get(robot_id)
            .and_then(|results| results.get(test_id))
            .cloned()
    }

    /// Status of the stored `online` result.
    pub fn online_status(&self, robot_id: &str) -> Option<TestStatus> {
        self.get_result(robot_id, ONLINE_TEST_ID)
            .map(|result| result.status)
    }

    pub fn is_known_reachable(&self, robot_id: &str) -> bool {
        self.online_status(robot_id).is_some_and(|status| status.is_ok())
    }

    pub fn get_activity(&self, robot_id: &str) -> RuntimeActivity {
        self.lock()
            .activity
            .get(robot_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Apply `update` to the robot's activity flags.
    pub fn set_activity(&self, robot_id: &str, update: ActivityUpdate) {
        let mut state = self.lock();
        let current = state.activity.entry(robot_id.to_string()).or_default();
        if let Some(searching) = update.searching {
            current.searching = searching;
        }
        if let Some(testing) = update.testing {
            current.testing = testing;
        }
        match update.phase {
            Some(phase) => current.phase = phase,
            None if !current.searching && !current.testing => current.phase = None,
            None => {}
        }
        current.updated_at = Some(Utc::now());
    }

    /// Last reachability probe or `online` result for the robot.
    pub fn reachability_snapshot(&self, robot_id: &str) -> Option<ReachabilityResult> {
        self.lock().reachability.get(robot_id).cloned()
    }

    pub fn store_reachability(&self, result: ReachabilityResult) {
        self.lock()
            .reachability
            .insert(result.robot_id.clone(), result);
    }

    /// Downgrade every non-connectivity result after the robot went offline.
    pub fn mark_stale(&self, robot_id: &str, source: ResultSource) {
        let now = Utc::now();
        let ids: Vec<String> = self
            .lock()
            .results
            .get(robot_id)
            .map(|results| {
                results
                    .keys()
                    .filter(|id| id.as_str() != ONLINE_TEST_ID)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut updates: Vec<(String, RuntimeTestResult)> = ids
            .into_iter()
            .filter(|id| id != BATTERY_TEST_ID)
            .map(|id| {
                let stale = RuntimeTestResult {
                    status: TestStatus::Warning,
                    value: "stale".to_string(),
                    details: "Robot unreachable; last result is stale.".to_string(),
                    ms: 0,
                    checked_at: now,
                    source,
                };
                (id, stale)
            })
            .collect();
        updates.push((
            BATTERY_TEST_ID.to_string(),
            offline_battery("Robot offline; cannot read /battery topic.", source),
        ));
        self.record_results(robot_id, updates);
    }

    /// Record the outcome of a test batch, inferring `online` when the batch
    /// did not probe it.
    pub fn record_test_run(&self, robot_id: &str, results: &[TestRunResult], source: ResultSource) {
        let now = Utc::now();
        let mut updates: Vec<(String, RuntimeTestResult)> = results
            .iter()
            .filter(|result| !result.id.trim().is_empty())
            .map(|result| {
                (
                    result.id.clone(),
                    RuntimeTestResult {
                        status: result.status,
                        value: non_empty(&result.value, "n/a"),
                        details: non_empty(&result.details, "No detail available"),
                        ms: result.ms,
                        checked_at: now,
                        source,
                    },
                )
            })
            .collect();

        if !results.iter().any(|result| result.id == ONLINE_TEST_ID) {
            if let Some(online) = infer_online(results, source) {
                updates.push((ONLINE_TEST_ID.to_string(), online));
            }
        }
        if !updates.is_empty() {
            self.record_results(robot_id, updates);
        }
    }
}

/// Heuristic reachability from a batch that did not probe it directly.
///
/// Any non-error result means at least one command ran. A batch where every
/// result failed with connection vocabulary means the robot is gone.
pub fn infer_online(results: &[TestRunResult], source: ResultSource) -> Option<RuntimeTestResult> {
    let others: Vec<&TestRunResult> = results
        .iter()
        .filter(|result| result.id != ONLINE_TEST_ID)
        .collect();
    if others.is_empty() {
        return None;
    }

    let (status, value, details) = if others.iter().any(|r| !r.status.is_error()) {
        (
            TestStatus::Ok,
            "reachable",
            "Inferred online: at least one test command executed.",
        )
    } else if others.iter().all(|r| is_connectivity_failure(r)) {
        (
            TestStatus::Error,
            "unreachable",
            "Inferred offline: automated tests failed for SSH/connectivity reasons.",
        )
    } else {
        return None;
    };

    Some(RuntimeTestResult {
        status,
        value: value.to_string(),
        details: details.to_string(),
        ms: 0,
        checked_at: Utc::now(),
        source,
    })
}

fn is_connectivity_failure(result: &TestRunResult) -> bool {
    if !result.status.is_error() {
        return false;
    }
    let details = result.details.to_lowercase();
    let value = result.value.to_lowercase();
    details.contains("ssh")
        || details.contains("connect")
        || details.contains("auth")
        || value == "execution_error"
        || value == "command_error"
}

/// Battery entry for a robot that cannot be read.
pub fn offline_battery(details: &str, source: ResultSource) -> RuntimeTestResult {
    RuntimeTestResult {
        status: TestStatus::Error,
        value: "unavailable".to_string(),
        details: non_empty(details, "Robot offline; cannot read /battery topic."),
        ms: 0,
        checked_at: Utc::now(),
        source,
    }
}

fn snapshot_from_runtime(robot_id: &str, online: &RuntimeTestResult) -> ReachabilityResult {
    ReachabilityResult {
        robot_id: robot_id.to_string(),
        status: online.status,
        value: non_empty(&online.value, "unreachable"),
        details: non_empty(&online.details, "No detail available"),
        ms: online.ms,
        checked_at: online.checked_at,
        source: online.source,
        error_code: online
            .status
            .is_error()
            .then(|| "connectivity_error".to_string()),
    }
}

fn non_empty(text: &str, fallback: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn result(status: TestStatus, at: DateTime<Utc>, source: ResultSource) -> RuntimeTestResult {
        RuntimeTestResult {
            status,
            value: status.as_str().to_string(),
            details: String::new(),
            ms: 1,
            checked_at: at,
            source,
        }
    }

    fn run_result(id: &str, status: TestStatus, value: &str, details: &str) -> TestRunResult {
        TestRunResult {
            id: id.to_string(),
            status,
            value: value.to_string(),
            details: details.to_string(),
            ms: 0,
            source: None,
            error_code: None,
            steps: Vec::new(),
            raw: None,
        }
    }

    #[test]
    fn test_equal_timestamp_lower_rank_is_ignored() {
        let store = RuntimeStateStore::new();
        let at = Utc::now();
        store.record_result("r1", "general", result(TestStatus::Ok, at, ResultSource::Manual));

        let applied = store.record_result(
            "r1",
            "general",
            result(TestStatus::Error, at, ResultSource::AutoMonitor),
        );
        assert!(!applied);
        assert_eq!(store.get_result("r1", "general").unwrap().status, TestStatus::Ok);

        let applied = store.record_result(
            "r1",
            "general",
            result(TestStatus::Warning, at, ResultSource::Live),
        );
        assert!(applied);
    }

    #[test]
    fn test_newer_timestamp_always_wins() {
        let store = RuntimeStateStore::new();
        let at = Utc::now();
        store.record_result("r1", "general", result(TestStatus::Ok, at, ResultSource::Manual));
        let older = at - Duration::seconds(1);
        assert!(!store.record_result("r1", "general", result(TestStatus::Error, older, ResultSource::Manual)));

        let newer = at + Duration::milliseconds(1);
        assert!(store.record_result("r1", "general", result(TestStatus::Error, newer, ResultSource::Cache)));
        assert_eq!(store.get_result("r1", "general").unwrap().source, ResultSource::Cache);
    }

    #[test]
    fn test_online_update_refreshes_snapshot() {
        let store = RuntimeStateStore::new();
        store.record_result(
            "r1",
            ONLINE_TEST_ID,
            result(TestStatus::Error, Utc::now(), ResultSource::AutoMonitor),
        );
        let snapshot = store.reachability_snapshot("r1").unwrap();
        assert_eq!(snapshot.status, TestStatus::Error);
        assert_eq!(snapshot.error_code.as_deref(), Some("connectivity_error"));
        assert!(!store.is_known_reachable("r1"));
    }

    #[test]
    fn test_results_are_copies() {
        let store = RuntimeStateStore::new();
        store.record_result("r1", "a", result(TestStatus::Ok, Utc::now(), ResultSource::Manual));
        let mut copy = store.get_results("r1");
        copy.clear();
        assert_eq!(store.get_results("r1").len(), 1);
    }

    #[test]
    fn test_phase_cleared_when_idle() {
        let store = RuntimeStateStore::new();
        store.set_activity(
            "r1",
            ActivityUpdate::searching(true).with_phase(Some(ActivityPhase::OnlineProbe)),
        );
        assert_eq!(store.get_activity("r1").phase, Some(ActivityPhase::OnlineProbe));

        store.set_activity("r1", ActivityUpdate::searching(false));
        let activity = store.get_activity("r1");
        assert!(!activity.searching);
        assert_eq!(activity.phase, None);
        assert!(activity.updated_at.is_some());

        store.set_activity(
            "r1",
            ActivityUpdate::default().with_phase(Some(ActivityPhase::Fixing)),
        );
        assert_eq!(store.get_activity("r1").phase, Some(ActivityPhase::Fixing));
    }

    #[test]
    fn test_mark_stale() {
        let store = RuntimeStateStore::new();
        let earlier = Utc::now() - Duration::seconds(5);
        store.record_results(
            "r1",
            [
                ("general".to_string(), result(TestStatus::Ok, earlier, ResultSource::Manual)),
                ("online".to_string(), result(TestStatus::Error, earlier, ResultSource::AutoMonitor)),
            ],
        );
        store.mark_stale("r1", ResultSource::AutoMonitor);

        let results = store.get_results("r1");
        assert_eq!(results["general"].value, "stale");
        assert_eq!(results["general"].status, TestStatus::Warning);
        assert_eq!(results["battery"].value, "unavailable");
        assert_eq!(results["online"].status, TestStatus::Error);
    }

    #[test]
    fn test_inferred_online_from_any_success() {
        let store = RuntimeStateStore::new();
        store.record_test_run(
            "r1",
            &[
                run_result("general", TestStatus::Ok, "ok", "fine"),
                run_result("lidar", TestStatus::Error, "missing", "no scan"),
            ],
            ResultSource::Manual,
        );
        let online = store.get_result("r1", ONLINE_TEST_ID).unwrap();
        assert_eq!(online.status, TestStatus::Ok);
        assert_eq!(online.details, "Inferred online: at least one test command executed.");
    }

    #[test]
    fn test_inferred_offline_only_for_connectivity_failures() {
        let connectivity = [run_result(
            "general",
            TestStatus::Error,
            "connectivity_error",
            "SSH connect failed for r1 (10.0.0.1:22): refused",
        )];
        let online = infer_online(&connectivity, ResultSource::AutoMonitor).unwrap();
        assert_eq!(online.status, TestStatus::Error);

        let logic = [run_result("general", TestStatus::Error, "missing", "Topic not found")];
        assert!(infer_online(&logic, ResultSource::AutoMonitor).is_none());
    }

    #[test]
    fn test_explicit_online_result_is_not_inferred() {
        let store = RuntimeStateStore::new();
        store.record_test_run(
            "r1",
            &[
                run_result("online", TestStatus::Error, "unreachable", "down"),
                run_result("general", TestStatus::Ok, "ok", "fine"),
            ],
            ResultSource::Manual,
        );
        assert_eq!(store.online_status("r1"), Some(TestStatus::Error));
    }
}
