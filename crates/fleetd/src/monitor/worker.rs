//! Background monitor loop.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use fleetd_protocol::{ActivityPhase, MonitorConfig, ResultSource, RuntimeTestResult, TestStatus};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::{MonitorControl, Signal};
use crate::catalog::{CatalogHandle, RobotType};
use crate::config::{MonitorSettings, secs};
use crate::error::FleetResult;
use crate::executor::{TestExecutor, robot_type_of};
use crate::guard::{AUTO_MONITOR_SESSION_ID, ActivityGuard, ActivitySource};
use crate::probes::{Reachability, parse_battery, parse_topics_presence, topic_tests};
use crate::runner::CommandRunner;
use crate::state::{
    ActivityUpdate, BATTERY_TEST_ID, ONLINE_TEST_ID, RuntimeStateStore, offline_battery,
};

const MIN_TICK_SECS: f64 = 0.2;

/// Collaborators the monitor reads from and writes to.
#[derive(Clone)]
pub struct MonitorDeps {
    pub catalog: CatalogHandle,
    pub runner: CommandRunner,
    pub reachability: Reachability,
    pub executor: TestExecutor,
    pub state: RuntimeStateStore,
    pub guard: ActivityGuard,
    pub control: MonitorControl,
}

struct MonitorInner {
    deps: MonitorDeps,
    settings: MonitorSettings,
    recovering: Mutex<HashSet<String>>,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls reachability, battery and topics for every robot on a fixed tick.
pub struct AutoMonitor {
    inner: Arc<MonitorInner>,
    running: Mutex<Option<Running>>,
}

impl AutoMonitor {
    pub fn new(deps: MonitorDeps, settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                deps,
                settings,
                recovering: Mutex::new(HashSet::new()),
            }),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Spawn the loop. Calling it while the loop runs is a no-op.
    pub fn start(&self) {
        let mut running = self.running();
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.run_loop(stop_rx).await });
        *running = Some(Running { stop, handle });
    }

    /// Signal the loop to stop and wait for it, up to the configured join
    /// wait. A loop still busy after that is aborted.
    pub async fn stop(&self) {
        let Some(Running { stop, mut handle }) = self.running().take() else {
            return;
        };
        let _ = stop.send(true);
        let wait = secs(self.inner.settings.stop_join_wait_secs);
        if tokio::time::timeout(wait, &mut handle).await.is_err() {
            warn!("Monitor loop did not stop within {wait:?}; aborting");
            handle.abort();
        }
        info!("Monitor stopped");
    }

    /// Run one pass over every robot.
    pub async fn run_tick(&self) {
        self.inner.run_tick().await;
    }

    /// Robots with a recovery run in flight.
    pub fn recovering(&self) -> Vec<String> {
        self.inner.recovering().iter().cloned().collect()
    }
}

impl MonitorInner {
    fn recovering(&self) -> MutexGuard<'_, HashSet<String>> {
        match self.recovering.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let tick = secs(self.settings.tick_interval_secs.max(MIN_TICK_SECS));
        info!("Monitor started (tick {tick:?})");
        loop {
            let stopped = *stop.borrow();
            if stopped {
                break;
            }
            let started = Instant::now();
            self.run_tick().await;
            let wait = tick.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Monitor loop exited");
    }

    async fn run_tick(self: &Arc<Self>) {
        let robot_ids = self.deps.catalog.snapshot().robot_ids();
        if robot_ids.is_empty() {
            return;
        }
        let config = self.deps.control.config();
        let workers = config.parallelism.clamp(1, robot_ids.len());
        let config = &config;

        stream::iter(robot_ids)
            .for_each_concurrent(workers, |robot_id| async move {
                if let Err(err) = self.process_robot(&robot_id, config).await {
                    warn!("Monitor pass for {robot_id} failed: {err}");
                }
            })
            .await;
    }

    async fn process_robot(
        self: &Arc<Self>,
        robot_id: &str,
        config: &MonitorConfig,
    ) -> FleetResult<()> {
        let deps = &self.deps;
        if deps.guard.is_busy(robot_id) || deps.guard.has_recent_manual_activity(robot_id) {
            debug!("Skipping {robot_id}: busy or recently used");
            return Ok(());
        }

        if deps.state.get_activity(robot_id).testing {
            return Ok(());
        }
        let was_online = deps.state.is_known_reachable(robot_id);

        let catalog = deps.catalog.snapshot();
        let robot_type = robot_type_of(&catalog, robot_id)?;
        let now = Instant::now();

        if !was_online && deps.control.due(robot_id, Signal::Online, now) {
            deps.control.schedule(robot_id, Signal::Online, now);
            if self.probe_online(robot_id).await? {
                info!("{robot_id} is back online");
                deps.control.reset(robot_id, Signal::Battery);
                deps.control.reset(robot_id, Signal::Topics);
                self.trigger_recovery(robot_id, robot_type);
                return Ok(());
            }
        }

        if !deps.state.is_known_reachable(robot_id) {
            deps.runner
                .sessions()
                .close(AUTO_MONITOR_SESSION_ID, robot_id)
                .await;
            debug!("{robot_id} is offline");
            deps.state.mark_stale(robot_id, ResultSource::AutoMonitor);
            return Ok(());
        }

        let now = Instant::now();
        if deps.control.due(robot_id, Signal::Battery, now) {
            deps.control.schedule(robot_id, Signal::Battery, now);
            self.refresh_battery(robot_id, robot_type).await;
        }
        if config.mode.includes_topics() && deps.control.due(robot_id, Signal::Topics, now) {
            deps.control.schedule(robot_id, Signal::Topics, now);
            self.refresh_topics(robot_id, robot_type).await;
        }
        Ok(())
    }

    /// Forced short probe. The searching flag stays up long enough for
    /// clients polling activity to see it.
    async fn probe_online(&self, robot_id: &str) -> FleetResult<bool> {
        let deps = &self.deps;
        deps.state.set_activity(
            robot_id,
            ActivityUpdate::searching(true).with_phase(Some(ActivityPhase::OnlineProbe)),
        );
        let started = Instant::now();
        let probe = deps
            .reachability
            .check_online(robot_id, Some(self.settings.online_probe_timeout_secs), true)
            .await;

        let min_visible = secs(self.settings.activity_min_visible_secs);
        if let Some(rest) = min_visible.checked_sub(started.elapsed()) {
            tokio::time::sleep(rest).await;
        }
        deps.state
            .set_activity(robot_id, ActivityUpdate::searching(false));

        let probe = probe?;
        deps.state.record_result(
            robot_id,
            ONLINE_TEST_ID,
            probe.to_runtime(ResultSource::AutoMonitor),
        );
        Ok(probe.is_reachable())
    }

    async fn refresh_battery(&self, robot_id: &str, robot_type: &RobotType) {
        let deps = &self.deps;
        let command = robot_type
            .battery_command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .unwrap_or(&self.settings.battery_command);

        let started = Instant::now();
        let output = deps
            .runner
            .run_command(
                AUTO_MONITOR_SESSION_ID,
                robot_id,
                command,
                Some(self.settings.battery_timeout_secs),
                ActivitySource::Manual,
            )
            .await;
        let ms = elapsed_ms(started);

        let updates = match output {
            Ok(output) => vec![
                (
                    ONLINE_TEST_ID.to_string(),
                    auto_result(
                        TestStatus::Ok,
                        "reachable",
                        "SSH connected and authenticated.".to_string(),
                        ms,
                        ResultSource::AutoMonitor,
                    ),
                ),
                (BATTERY_TEST_ID.to_string(), parse_battery(&output, ms)),
            ],
            Err(err) => {
                debug!("Battery probe on {robot_id} failed: {err}");
                deps.runner
                    .sessions()
                    .close(AUTO_MONITOR_SESSION_ID, robot_id)
                    .await;
                let details = err.to_string();
                vec![
                    (
                        ONLINE_TEST_ID.to_string(),
                        auto_result(
                            TestStatus::Error,
                            "unreachable",
                            details.clone(),
                            ms,
                            ResultSource::AutoMonitor,
                        ),
                    ),
                    (
                        BATTERY_TEST_ID.to_string(),
                        offline_battery(&details, ResultSource::AutoMonitor),
                    ),
                ]
            }
        };
        deps.state.record_results(robot_id, updates);
    }

    async fn refresh_topics(&self, robot_id: &str, robot_type: &RobotType) {
        let tests = topic_tests(robot_type);
        if tests.is_empty() {
            return;
        }
        let runner = &self.deps.runner;
        let started = Instant::now();
        let snapshot = async {
            runner
                .run_command(
                    AUTO_MONITOR_SESSION_ID,
                    robot_id,
                    &self.settings.topics_setup_command,
                    Some(self.settings.topics_setup_timeout_secs),
                    ActivitySource::Manual,
                )
                .await?;
            runner
                .run_command(
                    AUTO_MONITOR_SESSION_ID,
                    robot_id,
                    &self.settings.topics_command,
                    Some(self.settings.topics_timeout_secs),
                    ActivitySource::Manual,
                )
                .await
        }
        .await;
        let ms = elapsed_ms(started);

        let updates: Vec<(String, RuntimeTestResult)> = match snapshot {
            Ok(output) => tests
                .into_iter()
                .map(|test| {
                    let presence =
                        parse_topics_presence(&output, &test.required_topics, &test.namespace);
                    let result = auto_result(
                        presence.status,
                        &presence.value,
                        presence.details,
                        ms,
                        ResultSource::AutoMonitorTopics,
                    );
                    (test.id, result)
                })
                .collect(),
            Err(err) => {
                debug!("Topic snapshot on {robot_id} failed: {err}");
                let mut details = err.to_string();
                if details.trim().is_empty() {
                    details = "Unable to run topic snapshot.".to_string();
                }
                tests
                    .into_iter()
                    .map(|test| {
                        let result = auto_result(
                            TestStatus::Error,
                            "missing",
                            details.clone(),
                            ms,
                            ResultSource::AutoMonitorTopics,
                        );
                        (test.id, result)
                    })
                    .collect()
            }
        };
        self.deps.state.record_results(robot_id, updates);
    }

    /// Start one recovery run for the robot unless one is already running.
    fn trigger_recovery(self: &Arc<Self>, robot_id: &str, robot_type: &RobotType) {
        if !self.recovering().insert(robot_id.to_string()) {
            debug!("Recovery for {robot_id} already in flight");
            return;
        }

        let mut seen = HashSet::new();
        let test_ids: Vec<String> = robot_type
            .tests
            .iter()
            .filter(|entry| entry.enabled && entry.id != ONLINE_TEST_ID)
            .filter(|entry| seen.insert(entry.id.clone()))
            .map(|entry| entry.id.clone())
            .collect();

        self.deps.state.set_activity(
            robot_id,
            ActivityUpdate::testing(true).with_phase(Some(ActivityPhase::FullTestAfterRecovery)),
        );
        let claim = RecoveryClaim {
            inner: Arc::clone(self),
            robot_id: robot_id.to_string(),
        };
        tokio::spawn(async move { claim.run(test_ids).await });
    }
}

/// In-flight recovery run. Dropping it clears the testing flag and the
/// in-flight mark, however the run ended.
struct RecoveryClaim {
    inner: Arc<MonitorInner>,
    robot_id: String,
}

impl RecoveryClaim {
    async fn run(self, test_ids: Vec<String>) {
        if test_ids.is_empty() {
            return;
        }
        let deps = &self.inner.deps;
        info!(
            "Running {} recovery test(s) on {}",
            test_ids.len(),
            self.robot_id
        );
        match deps
            .executor
            .run_tests(&self.robot_id, AUTO_MONITOR_SESSION_ID, Some(&test_ids), false)
            .await
        {
            Ok(results) => {
                deps.state
                    .record_test_run(&self.robot_id, &results, ResultSource::AutoMonitor);
            }
            Err(err) => warn!("Recovery run on {} failed: {err}", self.robot_id),
        }
    }
}

impl Drop for RecoveryClaim {
    fn drop(&mut self) {
        self.inner.deps.state.set_activity(
            &self.robot_id,
            ActivityUpdate::testing(false).with_phase(None),
        );
        self.inner.recovering().remove(&self.robot_id);
    }
}

fn auto_result(
    status: TestStatus,
    value: &str,
    details: String,
    ms: u64,
    source: ResultSource,
) -> RuntimeTestResult {
    RuntimeTestResult {
        status,
        value: value.to_string(),
        details,
        ms,
        checked_at: Utc::now(),
        source,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
