//! Busy and defer tracking that keeps background probes away from robots an
//! operator (or a fix job) is working on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{ActivityConfig, secs};

/// Session id used by the background monitor. Never counts as manual activity.
pub const AUTO_MONITOR_SESSION_ID: &str = "__auto-monitor__";

/// Who caused a command or session access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySource {
    Manual,
    /// Reachability search started by an operator.
    ManualSearch,
    /// Command issued by a fix job. Extends the defer window.
    AutoFix,
}

#[derive(Debug, Default)]
struct GuardState {
    last_manual: HashMap<String, Instant>,
    defer_until: HashMap<String, Instant>,
    search_runs: HashMap<String, usize>,
    fix_runs: HashSet<String>,
    test_runs: HashSet<(String, String)>,
}

impl GuardState {
    fn is_busy(&self, robot_id: &str) -> bool {
        self.search_runs.get(robot_id).copied().unwrap_or(0) > 0
            || self.fix_runs.contains(robot_id)
            || self.test_runs.iter().any(|(robot, _)| robot == robot_id)
    }
}

/// Shared activity guard.
#[derive(Debug, Clone)]
pub struct ActivityGuard {
    state: Arc<Mutex<GuardState>>,
    manual_defer: Duration,
    auto_fix_defer: Duration,
}

impl ActivityGuard {
    pub fn new(config: &ActivityConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(GuardState::default())),
            manual_defer: secs(config.manual_defer_secs),
            auto_fix_defer: secs(config.auto_fix_defer_secs),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        lock_state(&self.state)
    }

    /// Record operator activity on a robot.
    pub fn mark_manual_activity(
        &self,
        robot_id: &str,
        client_session_id: Option<&str>,
        source: ActivitySource,
    ) {
        if client_session_id == Some(AUTO_MONITOR_SESSION_ID) {
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();
        state.last_manual.insert(robot_id.to_string(), now);
        if source == ActivitySource::AutoFix {
            let until = now + self.auto_fix_defer;
            let entry = state.defer_until.entry(robot_id.to_string()).or_insert(until);
            if *entry < until {
                *entry = until;
            }
        }
    }

    /// True while the robot is inside a manual or fix defer window.
    pub fn has_recent_manual_activity(&self, robot_id: &str) -> bool {
        let now = Instant::now();
        let state = self.lock();
        let recent = state
            .last_manual
            .get(robot_id)
            .is_some_and(|at| now.duration_since(*at) < self.manual_defer);
        let deferred = state
            .defer_until
            .get(robot_id)
            .is_some_and(|until| now < *until);
        recent || deferred
    }

    /// True while a search, fix or test run is active on the robot.
    pub fn is_busy(&self, robot_id: &str) -> bool {
        self.lock().is_busy(robot_id)
    }

    /// Mark a reachability search. Several searches may overlap.
    pub fn begin_search(&self, robot_id: &str) -> BusyTicket {
        *self
            .lock()
            .search_runs
            .entry(robot_id.to_string())
            .or_insert(0) += 1;
        self.mark_manual_activity(robot_id, None, ActivitySource::ManualSearch);
        BusyTicket {
            state: Arc::clone(&self.state),
            kind: BusyKind::Search(robot_id.to_string()),
        }
    }

    /// Claim the robot for a fix job. Fails if anything else is running.
    pub fn try_begin_fix(&self, robot_id: &str) -> Option<BusyTicket> {
        let mut state = self.lock();
        if state.is_busy(robot_id) {
            return None;
        }
        state.fix_runs.insert(robot_id.to_string());
        Some(BusyTicket {
            state: Arc::clone(&self.state),
            kind: BusyKind::Fix(robot_id.to_string()),
        })
    }

    /// Claim `(robot, session)` for a test run. Fails if that pair is active.
    pub fn try_begin_test(&self, robot_id: &str, client_session_id: &str) -> Option<BusyTicket> {
        let key = (robot_id.to_string(), client_session_id.to_string());
        let mut state = self.lock();
        if !state.test_runs.insert(key.clone()) {
            return None;
        }
        Some(BusyTicket {
            state: Arc::clone(&self.state),
            kind: BusyKind::Test(key),
        })
    }
}

fn lock_state(state: &Mutex<GuardState>) -> MutexGuard<'_, GuardState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug)]
enum BusyKind {
    Search(String),
    Fix(String),
    Test((String, String)),
}

/// Releases its busy mark when dropped.
#[derive(Debug)]
pub struct BusyTicket {
    state: Arc<Mutex<GuardState>>,
    kind: BusyKind,
}

impl Drop for BusyTicket {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        match &self.kind {
            BusyKind::Search(robot_id) => {
                let remaining = match state.search_runs.get_mut(robot_id) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count
                    }
                    None => 0,
                };
                if remaining == 0 {
                    state.search_runs.remove(robot_id);
                }
            }
            BusyKind::Fix(robot_id) => {
                state.fix_runs.remove(robot_id);
            }
            BusyKind::Test(key) => {
                state.test_runs.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> ActivityGuard {
        ActivityGuard::new(&ActivityConfig {
            manual_defer_secs: 0.05,
            auto_fix_defer_secs: 0.2,
        })
    }

    #[test]
    fn test_monitor_session_does_not_mark_activity() {
        let guard = guard();
        guard.mark_manual_activity("r1", Some(AUTO_MONITOR_SESSION_ID), ActivitySource::Manual);
        assert!(!guard.has_recent_manual_activity("r1"));
        guard.mark_manual_activity("r1", Some("page-1"), ActivitySource::Manual);
        assert!(guard.has_recent_manual_activity("r1"));
    }

    #[test]
    fn test_manual_defer_expires() {
        let guard = guard();
        guard.mark_manual_activity("r1", None, ActivitySource::Manual);
        std::thread::sleep(Duration::from_millis(80));
        assert!(!guard.has_recent_manual_activity("r1"));
    }

    #[test]
    fn test_auto_fix_extends_defer() {
        let guard = guard();
        guard.mark_manual_activity("r1", None, ActivitySource::AutoFix);
        std::thread::sleep(Duration::from_millis(80));
        assert!(guard.has_recent_manual_activity("r1"));
    }

    #[test]
    fn test_tickets_release_on_drop() {
        let guard = guard();
        {
            let _search = guard.begin_search("r1");
            assert!(guard.is_busy("r1"));
            assert!(guard.try_begin_fix("r1").is_none());
        }
        assert!(!guard.is_busy("r1"));

        let fix = guard.try_begin_fix("r1").unwrap();
        assert!(guard.is_busy("r1"));
        drop(fix);
        assert!(!guard.is_busy("r1"));
    }

    #[test]
    fn test_overlapping_searches() {
        let guard = guard();
        let a = guard.begin_search("r1");
        let b = guard.begin_search("r1");
        drop(a);
        assert!(guard.is_busy("r1"));
        drop(b);
        assert!(!guard.is_busy("r1"));
    }

    #[test]
    fn test_same_test_pair_conflicts() {
        let guard = guard();
        let first = guard.try_begin_test("r1", "page-1").unwrap();
        assert!(guard.try_begin_test("r1", "page-1").is_none());
        let other = guard.try_begin_test("r1", "page-2");
        assert!(other.is_some());
        assert!(guard.is_busy("r1"));
        drop(first);
        drop(other);
        assert!(!guard.is_busy("r1"));
    }
}
