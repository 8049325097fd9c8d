//! SSH reachability probe with a short result cache.

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use fleetd_protocol::{ReachabilityResult, ResultSource, TestStatus};
use futures::stream::{self, StreamExt};
use log::debug;

use crate::config::{ReachabilityConfig, clamp_f64, secs};
use crate::error::FleetResult;
use crate::guard::ActivityGuard;
use crate::sessions::SessionStore;
use crate::state::RuntimeStateStore;

pub const CONNECTIVITY_ERROR_CODE: &str = "connectivity_error";

#[derive(Clone)]
pub struct Reachability {
    sessions: SessionStore,
    state: RuntimeStateStore,
    guard: ActivityGuard,
    config: ReachabilityConfig,
}

impl Reachability {
    pub fn new(
        sessions: SessionStore,
        state: RuntimeStateStore,
        guard: ActivityGuard,
        config: ReachabilityConfig,
    ) -> Self {
        Self {
            sessions,
            state,
            guard,
            config,
        }
    }

    pub fn clamp_timeout(&self, timeout_sec: Option<f64>) -> f64 {
        clamp_f64(
            timeout_sec.unwrap_or(self.config.default_timeout_secs),
            self.config.min_timeout_secs,
            self.config.max_timeout_secs,
        )
    }

    /// Probe one robot by opening and closing a throwaway shell.
    ///
    /// A probe younger than the cache TTL is returned with source `cache`
    /// unless `force_refresh` is set. Unknown robots and missing
    /// credentials are errors; an unreachable robot is a result.
    pub async fn check_online(
        &self,
        robot_id: &str,
        timeout_sec: Option<f64>,
        force_refresh: bool,
    ) -> FleetResult<ReachabilityResult> {
        if !force_refresh {
            if let Some(cached) = self.cached(robot_id) {
                return Ok(cached);
            }
        }

        let mut target = self.sessions.connect_target(robot_id)?;
        target.connect_timeout = secs(self.clamp_timeout(timeout_sec));
        let started = Instant::now();

        let result = match self
            .sessions
            .connect_detached(&target, self.sessions.shell_options())
            .await
        {
            Ok(shell) => {
                shell.close().await;
                ReachabilityResult {
                    robot_id: robot_id.to_string(),
                    status: TestStatus::Ok,
                    value: "reachable".to_string(),
                    details: format!(
                        "SSH connected and authenticated on {}.",
                        target.address()
                    ),
                    ms: elapsed_ms(started),
                    checked_at: Utc::now(),
                    source: ResultSource::Live,
                    error_code: None,
                }
            }
            Err(err) => {
                debug!("Reachability probe for {robot_id} failed: {err}");
                ReachabilityResult {
                    ms: elapsed_ms(started),
                    ..unreachable(robot_id, err.to_string())
                }
            }
        };

        self.state.store_reachability(result.clone());
        Ok(result)
    }

    fn cached(&self, robot_id: &str) -> Option<ReachabilityResult> {
        let snapshot = self.state.reachability_snapshot(robot_id)?;
        let age = Utc::now()
            .signed_duration_since(snapshot.checked_at)
            .to_std()
            .unwrap_or_default();
        (age <= secs(self.config.cache_ttl_secs)).then(|| ReachabilityResult {
            source: ResultSource::Cache,
            ..snapshot
        })
    }

    /// Probe several robots concurrently.
    ///
    /// Ids are deduplicated and the results keep request order. A failure on
    /// one robot becomes that robot's result and never affects the others.
    pub async fn check_batch(
        &self,
        robot_ids: &[String],
        timeout_sec: Option<f64>,
        force_refresh: bool,
        parallelism: Option<usize>,
    ) -> Vec<ReachabilityResult> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = robot_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }

        let workers = self.batch_workers(parallelism, ids.len());
        debug!("Checking {} robot(s) with {workers} worker(s)", ids.len());

        stream::iter(ids)
            .map(|robot_id| async move {
                let _search = self.guard.begin_search(&robot_id);
                match self.check_online(&robot_id, timeout_sec, force_refresh).await {
                    Ok(result) => result,
                    Err(err) => unreachable(&robot_id, err.to_string()),
                }
            })
            .buffered(workers)
            .collect()
            .await
    }

    /// Worker count for a batch of `len` robots.
    pub fn batch_workers(&self, requested: Option<usize>, len: usize) -> usize {
        let requested = requested
            .unwrap_or(self.config.batch_parallelism)
            .clamp(1, self.config.batch_max_parallelism.max(1));
        let safe_cap = self
            .config
            .batch_safe_cap
            .clamp(1, self.config.batch_max_parallelism.max(1));
        requested.min(safe_cap).min(len).max(1)
    }
}

/// Failed probe result.
pub fn unreachable(robot_id: &str, details: impl Into<String>) -> ReachabilityResult {
    ReachabilityResult {
        robot_id: robot_id.to_string(),
        status: TestStatus::Error,
        value: "unreachable".to_string(),
        details: details.into(),
        ms: 0,
        checked_at: Utc::now(),
        source: ResultSource::Live,
        error_code: Some(CONNECTIVITY_ERROR_CODE.to_string()),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CatalogDocuments, CatalogHandle};
    use crate::config::{ActivityConfig, SessionConfig};
    use crate::shell::ShellOptions;
    use crate::testing::ScriptedFleet;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn reachability(fleet: &ScriptedFleet) -> Reachability {
        let docs: CatalogDocuments = serde_json::from_value(json!({
            "robots": [
                {"id": "a", "ip": "10.0.0.1", "type": "rover", "ssh": {"username": "u", "password": "p"}},
                {"id": "b", "ip": "10.0.0.2", "type": "rover", "ssh": {"username": "u", "password": "p"}},
                {"id": "c", "ip": "10.0.0.3", "type": "rover", "ssh": {"username": "u", "password": "p"}}
            ]
        }))
        .unwrap();
        let guard = ActivityGuard::new(&ActivityConfig::default());
        let options = ShellOptions {
            banner_settle: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            idle_backoff: Duration::from_millis(5),
            ..ShellOptions::default()
        };
        let sessions = SessionStore::new(
            CatalogHandle::new(Catalog::from_documents(docs).unwrap()),
            Arc::new(fleet.clone()),
            guard.clone(),
            SessionConfig::default(),
            options,
        );
        Reachability::new(
            sessions,
            RuntimeStateStore::new(),
            guard,
            ReachabilityConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_probe_and_cache() {
        let fleet = ScriptedFleet::new();
        let probe = reachability(&fleet);

        let first = probe.check_online("a", None, false).await.unwrap();
        assert_eq!(first.status, TestStatus::Ok);
        assert_eq!(first.source, ResultSource::Live);
        assert_eq!(first.details, "SSH connected and authenticated on 10.0.0.1:22.");

        let second = probe.check_online("a", None, false).await.unwrap();
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(fleet.connect_count("10.0.0.1"), 1);

        let forced = probe.check_online("a", None, true).await.unwrap();
        assert_eq!(forced.source, ResultSource::Live);
        assert_eq!(fleet.connect_count("10.0.0.1"), 2);
    }

    #[tokio::test]
    async fn test_unreachable_probe_is_a_result() {
        let fleet = ScriptedFleet::new();
        fleet.set_unreachable("10.0.0.2", true);
        let probe = reachability(&fleet);

        let result = probe.check_online("b", Some(0.1), true).await.unwrap();
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.value, "unreachable");
        assert!(result.details.starts_with("SSH connect failed for b (10.0.0.2:22)"));
        assert_eq!(result.error_code.as_deref(), Some("connectivity_error"));
    }

    #[tokio::test]
    async fn test_batch_keeps_order_and_isolates_failures() {
        let fleet = ScriptedFleet::new();
        fleet.set_unreachable("10.0.0.2", true);
        let probe = reachability(&fleet);

        let ids: Vec<String> = ["c", "b", "a", "c", "ghost"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let results = probe.check_batch(&ids, None, true, Some(4)).await;
        let order: Vec<&str> = results.iter().map(|r| r.robot_id.as_str()).collect();
        assert_eq!(order, vec!["c", "b", "a", "ghost"]);
        assert_eq!(results[0].status, TestStatus::Ok);
        assert_eq!(results[1].status, TestStatus::Error);
        assert_eq!(results[2].status, TestStatus::Ok);
        assert_eq!(results[3].details, "Unknown robot id: ghost");
        assert!(!probe.guard.is_busy("a"));
    }

    #[test]
    fn test_batch_workers_are_capped() {
        let probe = reachability(&ScriptedFleet::new());
        assert_eq!(probe.batch_workers(None, 50), 8);
        assert_eq!(probe.batch_workers(Some(500), 50), 16);
        assert_eq!(probe.batch_workers(Some(0), 50), 1);
        assert_eq!(probe.batch_workers(Some(8), 3), 3);
    }
}
