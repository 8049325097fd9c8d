//! Test utilities and common setup.
#![allow(dead_code)]

use std::fs;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetd::FleetManager;
use fleetd::catalog::loader;
use fleetd::config::FleetConfig;
use fleetd::testing::ScriptedFleet;
use fleetd_protocol::FixJobRecord;
use serde_json::{Value, json};
use tempfile::TempDir;

pub const R1_HOST: &str = "10.0.0.1";
pub const R2_HOST: &str = "10.0.0.2";

/// A manager wired to a scripted fleet and a catalog written to disk.
pub struct TestFleet {
    pub fleet: ScriptedFleet,
    pub manager: FleetManager,
    pub dir: TempDir,
}

/// Config with fast polling and no activity deferral.
pub fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.sessions.banner_settle_secs = 0.0;
    config.sessions.poll_interval_ms = 5;
    config.sessions.reader_idle_backoff_ms = 5;
    config.activity.manual_defer_secs = 0.0;
    config.activity.auto_fix_defer_secs = 0.0;
    config.reachability.cache_ttl_secs = 0.0;
    config.monitor.activity_min_visible_secs = 0.0;
    config.monitor.tick_interval_secs = 0.2;
    config.monitor.stop_join_wait_secs = 1.0;
    config
}

/// Scripted robots that answer every catalog command successfully.
pub fn healthy_fleet() -> ScriptedFleet {
    let fleet = ScriptedFleet::new();
    fleet.respond("rostopic list", "/odom\n/cmd_vel\n/battery");
    fleet.respond("rostopic hz", "average rate: 10.002");
    fleet.respond("uname", "Linux rover 5.15.0");
    fleet.respond("cat /sys/battery", "voltage: 12.3\npercentage: 0.82");
    fleet.respond("systemctl restart", "");
    fleet
}

pub fn catalog_documents() -> Vec<(&'static str, Value)> {
    vec![
        (
            "robots.json",
            json!({"robots": [
                {"id": "r1", "ip": R1_HOST, "type": "rover", "ssh": {"username": "robot", "password": "secret"}},
                {"id": "r2", "ip": R2_HOST, "type": "rover", "ssh": {"username": "robot", "password": "secret"}}
            ]}),
        ),
        (
            "robot-types.json",
            json!([{
                "id": "rover",
                "name": "Rover",
                "topics": ["/odom"],
                "testRefs": ["online", "topics_present", "odom_rate", "general"],
                "fixRefs": ["restart_ros", "reflash"],
                "fixOverrides": {"reflash": {"enabled": false}},
                "autoMonitor": {"batteryCommand": "cat /sys/battery"}
            }]),
        ),
        (
            "command-primitives/topics.command.json",
            json!({"id": "topics", "command": "rostopic list", "timeoutSec": 5}),
        ),
        (
            "tests/connectivity.test.json",
            json!({"id": "connectivity", "mode": "online_probe", "checks": [{"id": "online"}]}),
        ),
        (
            "tests/topics.test.json",
            json!({
                "id": "topics_def",
                "execute": [{"command": "$topics$", "saveAs": "topics", "reuseKey": "topic_list"}],
                "checks": [{
                    "id": "topics_present",
                    "read": {"kind": "contains_string", "inputRef": "topics", "needle": "/odom"},
                    "pass": {"status": "ok", "value": "present", "details": "/odom is published."},
                    "fail": {"status": "error", "value": "missing", "details": "/odom is missing."}
                }]
            }),
        ),
        (
            "tests/rate.test.json",
            json!({
                "id": "rate_def",
                "execute": [
                    {"command": "$topics$", "saveAs": "listing", "reuseKey": "topic_list"},
                    {"command": "rostopic hz -w 5 /odom", "saveAs": "hz"}
                ],
                "checks": [{
                    "id": "odom_rate",
                    "read": {"kind": "contains_string", "inputRef": "hz", "needle": "average rate"},
                    "pass": {"value": "publishing"},
                    "fail": {"value": "silent"}
                }]
            }),
        ),
        (
            "tests/general.test.json",
            json!({
                "id": "general_def",
                "execute": [{"command": "uname -a", "saveAs": "uname"}],
                "checks": [{
                    "id": "general",
                    "read": {"kind": "contains_string", "inputRef": "uname", "needle": "linux"},
                    "metadata": {
                        "manualOnly": false,
                        "defaultStatus": "warning",
                        "defaultValue": "unchecked",
                        "defaultDetails": "Runs after recovery."
                    }
                }]
            }),
        ),
        (
            "fixes/restart.fix.json",
            json!({
                "id": "restart_ros",
                "label": "Restart ROS",
                "execute": [{"command": "sudo systemctl restart ros"}],
                "postTestIds": ["topics_present"]
            }),
        ),
        (
            "fixes/reflash.fix.json",
            json!({"id": "reflash", "execute": [{"command": "flash-firmware"}]}),
        ),
    ]
}

pub fn write_catalog(root: &Path, documents: Vec<(&str, Value)>) {
    for (relative, value) in documents {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create catalog dir");
        }
        fs::write(&path, serde_json::to_string_pretty(&value).expect("serialize"))
            .expect("write catalog document");
    }
}

pub fn test_fleet() -> TestFleet {
    test_fleet_with(healthy_fleet(), test_config())
}

pub fn test_fleet_with(fleet: ScriptedFleet, config: FleetConfig) -> TestFleet {
    test_fleet_from(fleet, config, catalog_documents())
}

/// Like [`test_fleet_with`], over a caller-supplied catalog.
pub fn test_fleet_from(
    fleet: ScriptedFleet,
    config: FleetConfig,
    documents: Vec<(&str, Value)>,
) -> TestFleet {
    let dir = tempfile::tempdir().expect("create catalog tempdir");
    write_catalog(dir.path(), documents);
    let catalog = loader::load_catalog(dir.path()).expect("load catalog");
    let manager =
        FleetManager::new(&config, catalog, Arc::new(fleet.clone())).expect("build manager");
    TestFleet {
        fleet,
        manager,
        dir,
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a fix job until it reaches a terminal status.
pub async fn wait_for_fix(manager: &FleetManager, robot_id: &str, run_id: &str) -> FixJobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = manager.get_fix_job(robot_id, run_id).expect("fix job exists");
        if record.status.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "fix job {run_id} did not finish: {record:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
