//! Asynchronous fix jobs.
//!
//! A job is accepted synchronously (validation, busy claim, `queued`
//! record) and then runs on its own task. Its record is the only channel
//! back to the caller: status, an append-only event log and the results.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use fleetd_protocol::{
    ActivityPhase, FixJobEvent, FixJobRecord, FixJobStatus, FixResult, FixTestRun, ResultSource,
    TestRunResult, TestStatus,
};
use log::{info, warn};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::catalog::{CatalogHandle, FixEntry, Vars, string_list};
use crate::definitions::{EventSink, Orchestrator, OutputCache, RunPlan};
use crate::error::{FleetError, FleetResult};
use crate::executor::{TestExecutor, robot_type_of};
use crate::guard::{ActivityGuard, ActivitySource, BusyTicket};
use crate::runner::CommandRunner;
use crate::state::{ActivityUpdate, RuntimeStateStore};

/// Caller input for [`FixJobRunner::start`].
#[derive(Debug, Clone, Default)]
pub struct FixRequest {
    pub robot_id: String,
    pub fix_id: String,
    pub client_session_id: Option<String>,
    /// Overlaid on the fix's own params. `postTestIds` replaces the fix's
    /// default post-verification list.
    pub params: Vars,
}

struct FixJob {
    run_id: String,
    robot_id: String,
    fix_id: String,
    client_session_id: String,
    entry: FixEntry,
    params: Vars,
}

struct FixInner {
    catalog: CatalogHandle,
    runner: CommandRunner,
    executor: TestExecutor,
    state: RuntimeStateStore,
    guard: ActivityGuard,
    jobs: DashMap<String, FixJobRecord>,
}

#[derive(Clone)]
pub struct FixJobRunner {
    inner: Arc<FixInner>,
}

impl FixJobRunner {
    pub fn new(
        catalog: CatalogHandle,
        runner: CommandRunner,
        executor: TestExecutor,
        state: RuntimeStateStore,
        guard: ActivityGuard,
    ) -> Self {
        Self {
            inner: Arc::new(FixInner {
                catalog,
                runner,
                executor,
                state,
                guard,
                jobs: DashMap::new(),
            }),
        }
    }

    /// Validate and queue a fix run. Returns the record as it stands when
    /// the job task has been spawned.
    pub fn start(&self, request: FixRequest) -> FleetResult<FixJobRecord> {
        let robot_id = request.robot_id.trim().to_string();
        let fix_id = request.fix_id.trim().to_string();
        if robot_id.is_empty() || fix_id.is_empty() {
            return Err(FleetError::bad_request("robot_id and fix_id are required"));
        }

        let catalog = self.inner.catalog.snapshot();
        let robot_type = robot_type_of(&catalog, &robot_id)?;
        let entry = robot_type.fix(&fix_id).ok_or_else(|| {
            FleetError::not_found(format!(
                "Fix '{fix_id}' is not configured for this robot type."
            ))
        })?;
        if !entry.enabled {
            return Err(FleetError::bad_request(format!("Fix '{fix_id}' is disabled.")));
        }

        let ticket = self.inner.guard.try_begin_fix(&robot_id).ok_or_else(|| {
            FleetError::conflict("Robot is busy with another active operation.")
        })?;

        let run_id = format!(
            "fixrun-{}-{}",
            Utc::now().timestamp_millis(),
            short_id()
        );
        let client_session_id = request
            .client_session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("fix-{robot_id}-{}", short_id()));

        let mut params = entry.params.clone();
        params.extend(request.params);

        let now = Utc::now();
        let record = FixJobRecord {
            run_id: run_id.clone(),
            robot_id: robot_id.clone(),
            fix_id: fix_id.clone(),
            client_session_id: client_session_id.clone(),
            status: FixJobStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            events: vec![FixJobEvent {
                at: now,
                kind: "queued".to_string(),
                message: format!("Fix '{fix_id}' queued."),
                data: Value::Null,
            }],
            fix_result: None,
            test_run: None,
            error: None,
        };
        self.inner.jobs.insert(run_id.clone(), record);
        info!("Queued fix '{fix_id}' on {robot_id} as {run_id}");

        let job = FixJob {
            run_id: run_id.clone(),
            robot_id: robot_id.clone(),
            fix_id,
            client_session_id,
            entry: entry.clone(),
            params,
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute(job, ticket).await });

        self.get(&robot_id, &run_id)
    }

    /// Snapshot of a job record.
    pub fn get(&self, robot_id: &str, run_id: &str) -> FleetResult<FixJobRecord> {
        self.inner
            .jobs
            .get(run_id)
            .filter(|record| record.robot_id == robot_id)
            .map(|record| record.value().clone())
            .ok_or_else(|| {
                FleetError::not_found(format!(
                    "Fix run '{run_id}' not found for robot '{robot_id}'."
                ))
            })
    }

    /// Every job recorded for the robot, oldest first.
    pub fn list(&self, robot_id: &str) -> Vec<FixJobRecord> {
        let mut records: Vec<FixJobRecord> = self
            .inner
            .jobs
            .iter()
            .filter(|record| record.robot_id == robot_id)
            .map(|record| record.value().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }
}

impl FixInner {
    async fn execute(self: Arc<Self>, job: FixJob, ticket: BusyTicket) {
        let _claim = FixClaim {
            state: self.state.clone(),
            robot_id: job.robot_id.clone(),
            _ticket: ticket,
        };

        let started = Utc::now();
        self.update(&job.run_id, |record| {
            if advance(record, FixJobStatus::Running) {
                record.started_at = Some(started);
            }
        });
        self.push_event(
            &job.run_id,
            "started",
            format!("Fix '{}' started.", job.fix_id),
            Value::Null,
        );
        self.state.set_activity(
            &job.robot_id,
            ActivityUpdate {
                searching: Some(false),
                testing: Some(true),
                phase: Some(Some(ActivityPhase::Fixing)),
            },
        );

        let outcome = self.run_fix(&job).await;
        self.runner
            .sessions()
            .close(&job.client_session_id, &job.robot_id)
            .await;

        let finished = Utc::now();
        match outcome {
            Ok((fix_result, test_run)) => {
                info!("Fix '{}' on {} succeeded", job.fix_id, job.robot_id);
                self.update(&job.run_id, |record| {
                    if advance(record, FixJobStatus::Succeeded) {
                        record.fix_result = Some(fix_result);
                        record.test_run = Some(test_run);
                        record.finished_at = Some(finished);
                        record.error = None;
                        append_event(
                            record,
                            "finished",
                            format!("Fix '{}' completed with status 'succeeded'.", job.fix_id),
                            Value::Null,
                        );
                    }
                });
            }
            Err(err) => {
                let message = err.to_string();
                warn!("Fix '{}' on {} failed: {message}", job.fix_id, job.robot_id);
                self.update(&job.run_id, |record| {
                    if advance(record, FixJobStatus::Failed) {
                        record.error = Some(message.clone());
                        record.finished_at = Some(finished);
                        append_event(
                            record,
                            "failed",
                            format!("Fix '{}' failed: {message}", job.fix_id),
                            Value::Null,
                        );
                    }
                });
            }
        }
    }

    async fn run_fix(&self, job: &FixJob) -> FleetResult<(FixResult, FixTestRun)> {
        let catalog = self.catalog.snapshot();
        let orchestrator = Orchestrator::new(catalog.primitives());
        let exec = self.runner.bind(
            job.client_session_id.as_str(),
            job.robot_id.as_str(),
            ActivitySource::AutoFix,
        );
        let events = JobEvents {
            inner: self,
            run_id: &job.run_id,
        };
        let run_scope = format!("fix:{}:{}", job.robot_id, job.run_id);
        let plan = RunPlan {
            execute: &job.entry.execute,
            checks: &[],
            params: job.params.clone(),
            run_scope: &run_scope,
            dry_run: false,
        };
        let mut cache = OutputCache::new();
        let run = orchestrator
            .run(plan, &exec, &events, &mut cache)
            .await
            .map_err(|failure| failure.error)?;

        let post_test_ids = match job.params.get("postTestIds") {
            Some(value @ Value::Array(_)) => string_list(Some(value)),
            _ => job.entry.post_test_ids.clone(),
        };

        let mut results: Vec<TestRunResult> = Vec::new();
        if !post_test_ids.is_empty() {
            events.emit(
                "post_tests_started",
                "Running post-fix tests.".to_string(),
                json!({"testIds": post_test_ids}),
            );
            results = self
                .executor
                .run_tests(
                    &job.robot_id,
                    &job.client_session_id,
                    Some(&post_test_ids),
                    false,
                )
                .await?;
            self.state
                .record_test_run(&job.robot_id, &results, ResultSource::Manual);
            events.emit(
                "post_tests_finished",
                "Post-fix tests completed.".to_string(),
                json!({"testCount": results.len()}),
            );
        }

        let fix_result = FixResult {
            status: TestStatus::Ok,
            details: "Fix run completed.".to_string(),
            commands_executed: run.commands,
            logs: run.steps,
            post_test_ids,
        };
        let count = results.len();
        Ok((fix_result, FixTestRun { results, count }))
    }

    fn update(&self, run_id: &str, apply: impl FnOnce(&mut FixJobRecord)) {
        if let Some(mut record) = self.jobs.get_mut(run_id) {
            apply(&mut record);
            record.updated_at = Utc::now();
        }
    }

    fn push_event(&self, run_id: &str, kind: &str, message: String, data: Value) {
        self.update(run_id, |record| append_event(record, kind, message, data));
    }
}

fn append_event(record: &mut FixJobRecord, kind: &str, message: String, data: Value) {
    record.events.push(FixJobEvent {
        at: Utc::now(),
        kind: kind.to_string(),
        message,
        data,
    });
}

/// Move the record forward. Backward or sideways transitions are ignored.
fn advance(record: &mut FixJobRecord, next: FixJobStatus) -> bool {
    if !record.status.can_advance_to(next) {
        return false;
    }
    record.status = next;
    true
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Appends definition progress to the job's event log.
struct JobEvents<'a> {
    inner: &'a FixInner,
    run_id: &'a str,
}

impl EventSink for JobEvents<'_> {
    fn emit(&self, kind: &str, message: String, data: Value) {
        self.inner.push_event(self.run_id, kind, message, data);
    }
}

/// Holds the fix busy mark. Dropping it releases the robot and resets its
/// activity flags.
struct FixClaim {
    state: RuntimeStateStore,
    robot_id: String,
    _ticket: BusyTicket,
}

impl Drop for FixClaim {
    fn drop(&mut self) {
        self.state.set_activity(
            &self.robot_id,
            ActivityUpdate::testing(false).with_phase(None),
        );
    }
}
