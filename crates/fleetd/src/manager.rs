//! The fleet core as one object.
//!
//! [`FleetManager`] wires the session store, runner, probes, executor,
//! runtime state, fix jobs and monitor together and exposes the operations
//! a transport layer calls. Arguments are always `(robot_id, client_session_id)`.

use std::path::Path;
use std::sync::Arc;

use fleetd_protocol::{
    FixJobRecord, MonitorConfig, MonitorConfigPatch, ReachabilityResult, ResultSource,
    RobotRuntimeView, RuntimeTestResult, TestRunResult, TestStatus, TestSummary,
};
use log::info;
use tracing::instrument;
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogHandle, loader};
use crate::config::FleetConfig;
use crate::error::{FleetError, FleetResult};
use crate::executor::{TestExecutor, robot_type_of};
use crate::fixes::{FixJobRunner, FixRequest};
use crate::guard::{ActivityGuard, ActivitySource};
use crate::monitor::{AutoMonitor, MonitorControl, MonitorDeps};
use crate::probes::Reachability;
use crate::runner::{CommandRunner, DEFAULT_READ_CHUNKS};
use crate::sessions::SessionStore;
use crate::shell::Connector;
use crate::state::{ONLINE_TEST_ID, RuntimeStateStore};

pub struct FleetManager {
    catalog: CatalogHandle,
    guard: ActivityGuard,
    sessions: SessionStore,
    runner: CommandRunner,
    reachability: Reachability,
    executor: TestExecutor,
    state: RuntimeStateStore,
    fixes: FixJobRunner,
    control: MonitorControl,
    monitor: AutoMonitor,
}

impl FleetManager {
    /// Build the core. Nothing connects and no background task starts until
    /// the first call that needs it, or [`FleetManager::start_monitor`].
    pub fn new(
        config: &FleetConfig,
        catalog: Catalog,
        connector: Arc<dyn Connector>,
    ) -> FleetResult<Self> {
        let options = config.sessions.shell_options().map_err(|e| {
            FleetError::bad_request(format!(
                "Invalid prompt pattern '{}': {e}",
                config.sessions.prompt_pattern
            ))
        })?;

        let catalog = CatalogHandle::new(catalog);
        let guard = ActivityGuard::new(&config.activity);
        let state = RuntimeStateStore::new();
        let sessions = SessionStore::new(
            catalog.clone(),
            connector,
            guard.clone(),
            config.sessions.clone(),
            options,
        );
        let runner = CommandRunner::new(sessions.clone(), guard.clone(), config.commands.clone());
        let reachability = Reachability::new(
            sessions.clone(),
            state.clone(),
            guard.clone(),
            config.reachability.clone(),
        );
        let executor = TestExecutor::new(catalog.clone(), runner.clone(), reachability.clone());
        let fixes = FixJobRunner::new(
            catalog.clone(),
            runner.clone(),
            executor.clone(),
            state.clone(),
            guard.clone(),
        );
        let control = MonitorControl::new(&config.monitor);
        let monitor = AutoMonitor::new(
            MonitorDeps {
                catalog: catalog.clone(),
                runner: runner.clone(),
                reachability: reachability.clone(),
                executor: executor.clone(),
                state: state.clone(),
                guard: guard.clone(),
                control: control.clone(),
            },
            config.monitor.clone(),
        );

        Ok(Self {
            catalog,
            guard,
            sessions,
            runner,
            reachability,
            executor,
            state,
            fixes,
            control,
            monitor,
        })
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.snapshot()
    }

    pub fn state(&self) -> &RuntimeStateStore {
        &self.state
    }

    pub fn guard(&self) -> &ActivityGuard {
        &self.guard
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn monitor(&self) -> &AutoMonitor {
        &self.monitor
    }

    // ========================================================================
    // Interactive sessions
    // ========================================================================

    pub async fn open_session(&self, robot_id: &str, client_session_id: &str) -> FleetResult<()> {
        let client_session_id = required(client_session_id, "client_session_id")?;
        self.sessions.get_or_connect(client_session_id, robot_id).await?;
        Ok(())
    }

    pub async fn close_session(&self, robot_id: &str, client_session_id: &str) {
        self.sessions.close(client_session_id, robot_id).await;
    }

    pub async fn send_input(
        &self,
        robot_id: &str,
        client_session_id: &str,
        text: &str,
    ) -> FleetResult<()> {
        let client_session_id = required(client_session_id, "client_session_id")?;
        self.runner.send_input(client_session_id, robot_id, text).await
    }

    /// Output produced since the previous read.
    pub async fn read_output(
        &self,
        robot_id: &str,
        client_session_id: &str,
        max_chunks: Option<usize>,
    ) -> FleetResult<String> {
        let client_session_id = required(client_session_id, "client_session_id")?;
        self.runner
            .read_output(
                client_session_id,
                robot_id,
                max_chunks.unwrap_or(DEFAULT_READ_CHUNKS).max(1),
            )
            .await
    }

    pub async fn resize(
        &self,
        robot_id: &str,
        client_session_id: &str,
        width: u32,
        height: u32,
    ) -> FleetResult<()> {
        let client_session_id = required(client_session_id, "client_session_id")?;
        self.runner
            .resize(client_session_id, robot_id, width.max(1), height.max(1))
            .await
    }

    // ========================================================================
    // Commands and tests
    // ========================================================================

    /// Run one command in the caller's session.
    #[instrument(skip(self, command))]
    pub async fn run_command(
        &self,
        robot_id: &str,
        client_session_id: &str,
        command: &str,
        timeout_sec: Option<f64>,
    ) -> FleetResult<String> {
        let client_session_id = required(client_session_id, "client_session_id")?;
        let command = required(command, "command")?;
        self.runner
            .run_command(
                client_session_id,
                robot_id,
                command,
                timeout_sec,
                ActivitySource::Manual,
            )
            .await
    }

    /// Run a robot's tests on behalf of an operator and record the results.
    ///
    /// Without a session id a throwaway one is used. Two runs for the same
    /// `(robot, session)` pair conflict.
    #[instrument(skip(self))]
    pub async fn run_tests(
        &self,
        robot_id: &str,
        client_session_id: Option<&str>,
        test_ids: Option<&[String]>,
        dry_run: bool,
    ) -> FleetResult<Vec<TestRunResult>> {
        let client_session_id = client_session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("test-{robot_id}-{}", short_id()));

        let _ticket = self
            .guard
            .try_begin_test(robot_id, &client_session_id)
            .ok_or_else(|| {
                FleetError::conflict("A test run is already active for this robot/session.")
            })?;
        self.guard.mark_manual_activity(
            robot_id,
            Some(&client_session_id),
            ActivitySource::Manual,
        );

        let results = self
            .executor
            .run_tests(robot_id, &client_session_id, test_ids, dry_run)
            .await?;
        if !dry_run {
            self.state
                .record_test_run(robot_id, &results, ResultSource::Manual);
        }
        Ok(results)
    }

    /// Probe many robots at once. One result per distinct id, in request
    /// order.
    #[instrument(skip(self))]
    pub async fn check_online_batch(
        &self,
        robot_ids: &[String],
        timeout_sec: Option<f64>,
        force_refresh: bool,
        parallelism: Option<usize>,
    ) -> Vec<ReachabilityResult> {
        self.reachability
            .check_batch(robot_ids, timeout_sec, force_refresh, parallelism)
            .await
    }

    // ========================================================================
    // Fix jobs
    // ========================================================================

    pub fn start_fix_job(&self, request: FixRequest) -> FleetResult<FixJobRecord> {
        self.fixes.start(request)
    }

    pub fn get_fix_job(&self, robot_id: &str, run_id: &str) -> FleetResult<FixJobRecord> {
        self.fixes.get(robot_id, run_id)
    }

    pub fn list_fix_jobs(&self, robot_id: &str) -> Vec<FixJobRecord> {
        self.fixes.list(robot_id)
    }

    // ========================================================================
    // Monitor
    // ========================================================================

    pub fn monitor_config(&self) -> MonitorConfig {
        self.control.config()
    }

    /// Patch the monitor. Takes effect on the next tick.
    pub fn update_monitor_config(&self, patch: MonitorConfigPatch) -> FleetResult<MonitorConfig> {
        let config = self.control.apply_patch(patch)?;
        info!(
            "Monitor config: mode={} parallelism={}",
            config.mode.as_str(),
            config.parallelism
        );
        Ok(config)
    }

    pub fn start_monitor(&self) {
        self.monitor.start();
    }

    /// Stop the monitor and close every session.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.sessions.close_all().await;
    }

    // ========================================================================
    // Catalog and runtime view
    // ========================================================================

    /// Swap in a new catalog. Open sessions and the monitor keep running.
    pub fn reload_catalog(&self, catalog: Catalog) {
        let robots = catalog.robots().len();
        self.catalog.replace(catalog);
        info!("Catalog reloaded ({robots} robot(s))");
    }

    /// Load and validate a catalog directory, then swap it in. The current
    /// catalog stays in place when validation fails.
    pub fn reload_catalog_from(&self, dir: &Path) -> FleetResult<()> {
        let catalog = loader::load_catalog(dir)?;
        self.reload_catalog(catalog);
        Ok(())
    }

    /// Dashboard view: stored results, falling back to configured defaults.
    pub fn runtime_view(&self, robot_id: &str) -> FleetResult<RobotRuntimeView> {
        let catalog = self.catalog.snapshot();
        let robot_type = robot_type_of(&catalog, robot_id)?;
        let stored = self.state.get_results(robot_id);

        let online = match stored.get(ONLINE_TEST_ID) {
            Some(result) => summary(ONLINE_TEST_ID, result),
            None => TestSummary {
                id: ONLINE_TEST_ID.to_string(),
                status: TestStatus::Warning,
                value: "unknown".to_string(),
                details: "Not checked yet".to_string(),
                checked_at: None,
                source: None,
            },
        };
        let mut tests = vec![online];
        tests.extend(
            robot_type
                .tests
                .iter()
                .filter(|entry| entry.id != ONLINE_TEST_ID)
                .map(|entry| match stored.get(&entry.id) {
                    Some(result) => summary(&entry.id, result),
                    None => TestSummary {
                        id: entry.id.clone(),
                        status: entry.default_status,
                        value: entry.default_value.clone(),
                        details: entry.default_details.clone(),
                        checked_at: None,
                        source: None,
                    },
                }),
        );

        Ok(RobotRuntimeView {
            robot_id: robot_id.to_string(),
            tests,
            activity: self.state.get_activity(robot_id),
        })
    }
}

fn summary(id: &str, result: &RuntimeTestResult) -> TestSummary {
    TestSummary {
        id: id.to_string(),
        status: result.status,
        value: result.value.clone(),
        details: result.details.clone(),
        checked_at: Some(result.checked_at),
        source: Some(result.source),
    }
}

fn required<'a>(value: &'a str, name: &str) -> FleetResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(FleetError::bad_request(format!("{name} is required")));
    }
    Ok(trimmed)
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
