//! Live monitor configuration and per-robot probe schedules.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use fleetd_protocol::{MonitorConfig, MonitorConfigPatch, MonitorMode};

use crate::config::{MonitorSettings, clamp_f64, secs};
use crate::error::{FleetError, FleetResult};

pub const MIN_SIGNAL_INTERVAL_SECS: f64 = 0.5;
pub const MAX_SIGNAL_INTERVAL_SECS: f64 = 60.0;
pub const MIN_TOPICS_INTERVAL_SECS: f64 = 5.0;
pub const MAX_TOPICS_INTERVAL_SECS: f64 = 300.0;
pub const MAX_PARALLELISM: usize = 100;

/// A signal the monitor polls on its own interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Online,
    Battery,
    Topics,
}

#[derive(Debug, Default)]
struct Schedules {
    next: HashMap<(String, Signal), Instant>,
}

#[derive(Debug)]
struct ControlState {
    config: MonitorConfig,
    schedules: Schedules,
}

/// Shared between the monitor loop and the configuration API. Cloning
/// shares the same state.
#[derive(Debug, Clone)]
pub struct MonitorControl {
    state: Arc<Mutex<ControlState>>,
}

impl MonitorControl {
    pub fn new(settings: &MonitorSettings) -> Self {
        let config = MonitorConfig {
            mode: settings.mode,
            topics_interval_sec: clamp_topics(settings.topics_interval_secs),
            online_interval_sec: clamp_signal(settings.online_interval_secs),
            battery_interval_sec: clamp_signal(settings.battery_interval_secs),
            parallelism: settings.parallelism.clamp(1, MAX_PARALLELISM),
        };
        Self {
            state: Arc::new(Mutex::new(ControlState {
                config,
                schedules: Schedules::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> MonitorConfig {
        self.lock().config.clone()
    }

    /// Apply a partial update. Values are clamped, and every schedule is
    /// cleared so the new intervals apply on the next tick.
    pub fn apply_patch(&self, patch: MonitorConfigPatch) -> FleetResult<MonitorConfig> {
        let mode = match patch.mode.as_deref() {
            Some(label) => Some(MonitorMode::parse(label).ok_or_else(|| {
                FleetError::bad_request(format!("Unsupported monitor mode: {label}"))
            })?),
            None => None,
        };

        let mut state = self.lock();
        let config = &mut state.config;
        if let Some(mode) = mode {
            config.mode = mode;
        }
        if let Some(value) = patch.topics_interval_sec {
            config.topics_interval_sec = clamp_topics(value);
        }
        if let Some(value) = patch.online_interval_sec {
            config.online_interval_sec = clamp_signal(value);
        }
        if let Some(value) = patch.battery_interval_sec {
            config.battery_interval_sec = clamp_signal(value);
        }
        if let Some(value) = patch.parallelism {
            config.parallelism = value.clamp(1, MAX_PARALLELISM);
        }
        let updated = config.clone();
        state.schedules.next.clear();
        Ok(updated)
    }

    fn interval(config: &MonitorConfig, signal: Signal) -> Duration {
        secs(match signal {
            Signal::Online => config.online_interval_sec,
            Signal::Battery => config.battery_interval_sec,
            Signal::Topics => config.topics_interval_sec,
        })
    }

    /// True when `signal` has never run for the robot or its slot has passed.
    pub fn due(&self, robot_id: &str, signal: Signal, now: Instant) -> bool {
        self.lock()
            .schedules
            .next
            .get(&(robot_id.to_string(), signal))
            .is_none_or(|at| now >= *at)
    }

    /// Book the next slot one interval after `now`.
    pub fn schedule(&self, robot_id: &str, signal: Signal, now: Instant) {
        let mut state = self.lock();
        let next = now + Self::interval(&state.config, signal);
        state
            .schedules
            .next
            .insert((robot_id.to_string(), signal), next);
    }

    /// Make `signal` due immediately.
    pub fn reset(&self, robot_id: &str, signal: Signal) {
        self.lock()
            .schedules
            .next
            .remove(&(robot_id.to_string(), signal));
    }
}

fn clamp_signal(value: f64) -> f64 {
    clamp_f64(value, MIN_SIGNAL_INTERVAL_SECS, MAX_SIGNAL_INTERVAL_SECS)
}

fn clamp_topics(value: f64) -> f64 {
    clamp_f64(value, MIN_TOPICS_INTERVAL_SECS, MAX_TOPICS_INTERVAL_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_clamps_values() {
        let control = MonitorControl::new(&MonitorSettings::default());
        let config = control
            .apply_patch(MonitorConfigPatch {
                mode: Some("online_battery_topics".to_string()),
                topics_interval_sec: Some(1.0),
                online_interval_sec: Some(600.0),
                battery_interval_sec: None,
                parallelism: Some(0),
            })
            .unwrap();
        assert_eq!(config.mode, MonitorMode::Extended);
        assert_eq!(config.topics_interval_sec, 5.0);
        assert_eq!(config.online_interval_sec, 60.0);
        assert_eq!(config.battery_interval_sec, 2.0);
        assert_eq!(config.parallelism, 1);
        assert_eq!(control.config(), config);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let control = MonitorControl::new(&MonitorSettings::default());
        let err = control
            .apply_patch(MonitorConfigPatch {
                mode: Some("everything".to_string()),
                parallelism: Some(4),
                ..MonitorConfigPatch::default()
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported monitor mode: everything");
        assert_eq!(err.status_code(), 400);
        assert_eq!(control.config().parallelism, 8);
    }

    #[test]
    fn test_schedule_and_reset() {
        let control = MonitorControl::new(&MonitorSettings::default());
        let now = Instant::now();
        assert!(control.due("r1", Signal::Battery, now));

        control.schedule("r1", Signal::Battery, now);
        assert!(!control.due("r1", Signal::Battery, now));
        assert!(control.due("r1", Signal::Battery, now + Duration::from_secs(3)));
        assert!(control.due("r1", Signal::Online, now));

        control.reset("r1", Signal::Battery);
        assert!(control.due("r1", Signal::Battery, now));
    }

    #[test]
    fn test_patch_clears_schedules() {
        let control = MonitorControl::new(&MonitorSettings::default());
        let now = Instant::now();
        control.schedule("r1", Signal::Topics, now);
        control.apply_patch(MonitorConfigPatch::default()).unwrap();
        assert!(control.due("r1", Signal::Topics, now));
    }
}
