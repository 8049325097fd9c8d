//! Runtime settings for the fleet core.
//!
//! Every section has a `Default` matching production behaviour. The binary
//! layers a TOML file and `FLEETD__*` environment variables on top.

use std::time::Duration;

use fleetd_protocol::MonitorMode;
use serde::{Deserialize, Serialize};

use crate::shell::{DEFAULT_PROMPT_PATTERN, PromptDetector, ShellOptions};

/// Convert a seconds value from configuration. Negative or non-finite
/// values become zero.
pub fn secs(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Clamp a float into `[min, max]`.
pub fn clamp_f64(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return min;
    }
    value.max(min).min(max)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub catalog: CatalogConfig,
    pub sessions: SessionConfig,
    pub commands: CommandConfig,
    pub reachability: ReachabilityConfig,
    pub activity: ActivityConfig,
    pub monitor: MonitorSettings,
}

/// Where catalog documents live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directory with robots.json, robot-types.json and definition folders.
    /// Defaults to `<data dir>/catalog`.
    pub dir: Option<String>,
}

/// Interactive shell sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close sessions unused for this long.
    pub idle_timeout_secs: f64,
    pub connect_timeout_secs: f64,
    /// Regex matched against the end of command output.
    pub prompt_pattern: String,
    pub term: String,
    pub width: u32,
    pub height: u32,
    pub banner_settle_secs: f64,
    pub reader_idle_backoff_ms: u64,
    pub reader_error_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 15.0 * 60.0,
            connect_timeout_secs: 10.0,
            prompt_pattern: DEFAULT_PROMPT_PATTERN.to_string(),
            term: "xterm-256color".to_string(),
            width: 160,
            height: 48,
            banner_settle_secs: 0.2,
            reader_idle_backoff_ms: 20,
            reader_error_backoff_ms: 50,
            poll_interval_ms: 50,
            queue_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn shell_options(&self) -> Result<ShellOptions, regex::Error> {
        Ok(ShellOptions {
            prompt: PromptDetector::new(&self.prompt_pattern)?,
            banner_settle: secs(self.banner_settle_secs),
            idle_backoff: Duration::from_millis(self.reader_idle_backoff_ms.max(1)),
            error_backoff: Duration::from_millis(self.reader_error_backoff_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            queue_capacity: self.queue_capacity.max(1),
        })
    }
}

/// One-shot command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub default_timeout_secs: f64,
    pub min_timeout_secs: f64,
    pub max_timeout_secs: f64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 20.0,
            min_timeout_secs: 0.5,
            max_timeout_secs: 3600.0,
        }
    }
}

/// Reachability probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReachabilityConfig {
    /// Reuse a probe result for this long unless a refresh is forced.
    pub cache_ttl_secs: f64,
    pub default_timeout_secs: f64,
    pub min_timeout_secs: f64,
    pub max_timeout_secs: f64,
    pub batch_parallelism: usize,
    pub batch_max_parallelism: usize,
    /// Upper bound on concurrent connects regardless of what callers ask for.
    pub batch_safe_cap: usize,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5.0,
            default_timeout_secs: 3.0,
            min_timeout_secs: 0.5,
            max_timeout_secs: 10.0,
            batch_parallelism: 8,
            batch_max_parallelism: 100,
            batch_safe_cap: 16,
        }
    }
}

/// Manual activity tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Background probes skip a robot for this long after manual activity.
    pub manual_defer_secs: f64,
    /// Longer deferral after a fix command, which may reboot or reflash.
    pub auto_fix_defer_secs: f64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            manual_defer_secs: 5.0,
            auto_fix_defer_secs: 90.0,
        }
    }
}

/// Background monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub enabled: bool,
    pub tick_interval_secs: f64,
    pub mode: MonitorMode,
    pub online_interval_secs: f64,
    pub battery_interval_secs: f64,
    pub topics_interval_secs: f64,
    pub parallelism: usize,
    pub online_probe_timeout_secs: f64,
    /// Keep the "searching" flag up at least this long so clients see it.
    pub activity_min_visible_secs: f64,
    pub battery_command: String,
    pub battery_timeout_secs: f64,
    pub topics_setup_command: String,
    pub topics_setup_timeout_secs: f64,
    pub topics_command: String,
    pub topics_timeout_secs: f64,
    pub stop_join_wait_secs: f64,
}

const ROS_SETUP: &str = "source /opt/ros/noetic/setup.bash >/dev/null 2>&1 || true; \
source ~/ws/devel/setup.bash >/dev/null 2>&1 || true";

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: 1.0,
            mode: MonitorMode::Basic,
            online_interval_secs: 2.0,
            battery_interval_secs: 2.0,
            topics_interval_secs: 30.0,
            parallelism: 8,
            online_probe_timeout_secs: 1.0,
            activity_min_visible_secs: 1.1,
            battery_command: format!("{ROS_SETUP}; timeout 6s rostopic echo -n 1 /battery"),
            battery_timeout_secs: 8.0,
            topics_setup_command: ROS_SETUP.to_string(),
            topics_setup_timeout_secs: 3.0,
            topics_command: "timeout 12s rostopic list".to_string(),
            topics_timeout_secs: 12.0,
            stop_join_wait_secs: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secs_handles_bad_values() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_f64(0.1, 0.5, 10.0), 0.5);
        assert_eq!(clamp_f64(99.0, 0.5, 10.0), 10.0);
        assert_eq!(clamp_f64(3.0, 0.5, 10.0), 3.0);
    }

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let config = FleetConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: FleetConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let parsed: FleetConfig = toml::from_str("[monitor]\nparallelism = 3\n").unwrap();
        assert_eq!(parsed.monitor.parallelism, 3);
        assert_eq!(parsed.monitor.tick_interval_secs, 1.0);
        assert_eq!(parsed.sessions.width, 160);
    }

    #[test]
    fn test_shell_options_from_config() {
        let options = SessionConfig::default().shell_options().unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(50));
        assert!(options.prompt.is_complete("user@r1:~$ "));
    }
}
