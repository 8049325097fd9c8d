//! Test, probe and activity result types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Status and source
// ============================================================================

/// Outcome class of a test or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Ok,
    Warning,
    Error,
}

impl TestStatus {
    /// Parse a status label. Anything unrecognised is treated as a warning.
    pub fn from_label(label: &str) -> Self {
        match label.trim() {
            "ok" => Self::Ok,
            "error" => Self::Error,
            _ => Self::Warning,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which producer generated a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultSource {
    /// Served from the short-lived reachability cache.
    Cache,
    /// Background monitor probe (reachability, battery, recovery tests).
    AutoMonitor,
    /// Background topic snapshot probe.
    AutoMonitorTopics,
    /// Operator-initiated run.
    Manual,
    /// Fresh reachability probe.
    Live,
    /// Test id or definition resolution failure.
    Resolver,
    /// Failure while executing a resolved test.
    Executor,
}

impl ResultSource {
    /// Tie-break priority for results sharing a timestamp.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Cache => 0,
            Self::AutoMonitor => 1,
            Self::AutoMonitorTopics => 2,
            Self::Manual | Self::Live => 3,
            Self::Resolver | Self::Executor => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::AutoMonitor => "auto-monitor",
            Self::AutoMonitorTopics => "auto-monitor-topics",
            Self::Manual => "manual",
            Self::Live => "live",
            Self::Resolver => "resolver",
            Self::Executor => "executor",
        }
    }
}

// ============================================================================
// Runtime state
// ============================================================================

/// Latest known outcome of one test for one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeTestResult {
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    /// Elapsed time of the producing run in milliseconds.
    pub ms: u64,
    pub checked_at: DateTime<Utc>,
    pub source: ResultSource,
}

/// Label describing what background work is visible on a robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    OnlineProbe,
    FullTestAfterRecovery,
    Fixing,
}

/// Per-robot "what is happening now" flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeActivity {
    pub searching: bool,
    pub testing: bool,
    pub phase: Option<ActivityPhase>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One row of a robot's dashboard: the stored result, or the test's
/// configured default when nothing has been recorded yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub id: String,
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    pub checked_at: Option<DateTime<Utc>>,
    pub source: Option<ResultSource>,
}

/// Everything the dashboard shows for one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotRuntimeView {
    pub robot_id: String,
    pub tests: Vec<TestSummary>,
    pub activity: RuntimeActivity,
}

// ============================================================================
// Execution records
// ============================================================================

/// Audit entry for one executed definition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub id: String,
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    pub ms: u64,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub used_cache: bool,
}

/// Log entry for one command sent to a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub id: String,
    pub command: String,
    pub timeout_sec: Option<f64>,
    pub output: String,
    pub exit_code: i32,
    pub ok: bool,
    pub duration_ms: u64,
    pub used_cache: bool,
}

/// Structured verdict of a read predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadVerdict {
    pub passed: bool,
    pub kind: String,
    pub details: String,
    pub matched: Vec<String>,
    pub missing: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_all: Option<bool>,
}

/// Execution metadata attached to a test run result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunRaw {
    /// Identifier shared by every test that came out of the same definition run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition_id: Option<String>,
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<ReadVerdict>,
}

/// One entry of a test batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRunResult {
    pub id: String,
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    pub ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ResultSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<TestRunRaw>,
}

impl TestRunResult {
    /// Result for a test that failed before or during execution.
    pub fn failure(
        id: impl Into<String>,
        value: impl Into<String>,
        details: impl Into<String>,
        error_code: impl Into<String>,
        source: ResultSource,
    ) -> Self {
        Self {
            id: id.into(),
            status: TestStatus::Error,
            value: value.into(),
            details: details.into(),
            ms: 0,
            source: Some(source),
            error_code: Some(error_code.into()),
            steps: Vec::new(),
            raw: None,
        }
    }
}

/// Result of a fleet reachability probe for one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityResult {
    pub robot_id: String,
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    pub ms: u64,
    pub checked_at: DateTime<Utc>,
    pub source: ResultSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ReachabilityResult {
    pub fn is_reachable(&self) -> bool {
        self.status.is_ok()
    }

    /// Project into a runtime "online" entry.
    pub fn to_runtime(&self, source: ResultSource) -> RuntimeTestResult {
        RuntimeTestResult {
            status: self.status,
            value: self.value.clone(),
            details: self.details.clone(),
            ms: self.ms,
            checked_at: self.checked_at,
            source,
        }
    }
}
