//! Fix job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::{CommandRecord, StepRecord, TestRunResult, TestStatus};

/// Lifecycle of a fix job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixJobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl FixJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_advance_to(&self, next: FixJobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

/// Timestamped milestone in a fix job's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixJobEvent {
    pub at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Outcome of the fix's own steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    pub status: TestStatus,
    pub details: String,
    pub commands_executed: Vec<CommandRecord>,
    pub logs: Vec<StepRecord>,
    pub post_test_ids: Vec<String>,
}

/// Post-verification test results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixTestRun {
    pub results: Vec<TestRunResult>,
    pub count: usize,
}

/// Snapshot of one asynchronous fix execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixJobRecord {
    pub run_id: String,
    pub robot_id: String,
    pub fix_id: String,
    pub client_session_id: String,
    pub status: FixJobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events: Vec<FixJobEvent>,
    pub fix_result: Option<FixResult>,
    pub test_run: Option<FixTestRun>,
    pub error: Option<String>,
}
