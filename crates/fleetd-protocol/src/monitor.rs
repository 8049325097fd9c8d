//! Background monitor configuration.

use serde::{Deserialize, Serialize};

/// Which signals the background monitor polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Reachability and battery.
    #[default]
    #[serde(rename = "online_battery")]
    Basic,
    /// Reachability, battery and topic presence.
    #[serde(rename = "online_battery_topics")]
    Extended,
}

impl MonitorMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "online_battery",
            Self::Extended => "online_battery_topics",
        }
    }

    /// Accepts the wire names and the `basic`/`extended` aliases.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "online_battery" | "basic" => Some(Self::Basic),
            "online_battery_topics" | "extended" => Some(Self::Extended),
            _ => None,
        }
    }

    pub fn includes_topics(&self) -> bool {
        matches!(self, Self::Extended)
    }
}

/// Effective monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    pub topics_interval_sec: f64,
    pub online_interval_sec: f64,
    pub battery_interval_sec: f64,
    pub parallelism: usize,
}

/// Partial update. `mode` stays textual so unsupported values can be rejected
/// with a message instead of a decode failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfigPatch {
    pub mode: Option<String>,
    pub topics_interval_sec: Option<f64>,
    pub online_interval_sec: Option<f64>,
    pub battery_interval_sec: Option<f64>,
    pub parallelism: Option<usize>,
}
