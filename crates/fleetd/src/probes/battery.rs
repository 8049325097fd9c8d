//! Parser for a single `/battery` topic message.

use std::collections::HashMap;

use chrono::Utc;
use fleetd_protocol::{ResultSource, RuntimeTestResult, TestStatus};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::shell::strip_ansi;

pub const VOLTAGE_EMPTY: f64 = 10.8;
pub const VOLTAGE_FULL: f64 = 12.6;
pub const LOW_BATTERY_ERROR_PERCENT: f64 = 15.0;
pub const LOW_BATTERY_WARNING_PERCENT: f64 = 30.0;

static FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][\w./-]*)\s*:\s*(.+)$").expect("valid battery field pattern")
});

static FLOAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("valid float pattern")
});

const ROS_ERRORS: &[&str] = &[
    "unknown topic",
    "unable to communicate with master",
    "cannot contact",
    "could not contact",
    "no messages received",
];

const PERCENT_KEYS: &[&str] = &[
    "percentage",
    "percent",
    "soc",
    "state_of_charge",
    "battery_percent",
];

const VOLTAGE_KEYS: &[&str] = &["voltage", "battery_voltage", "vbat", "volt"];

/// Turn `rostopic echo -n 1 /battery` output into a battery result.
pub fn parse_battery(raw_output: &str, elapsed_ms: u64) -> RuntimeTestResult {
    let cleaned = strip_ansi(raw_output).replace('\r', "");
    let lowered = cleaned.to_lowercase();
    if ROS_ERRORS.iter().any(|phrase| lowered.contains(phrase)) {
        return battery_result(
            TestStatus::Error,
            "unavailable",
            "Unable to read /battery topic.".to_string(),
            elapsed_ms,
        );
    }

    let fields: HashMap<String, String> = cleaned
        .lines()
        .filter_map(|line| FIELD.captures(line.trim()))
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().trim().to_lowercase();
            let value = caps.get(2)?.as_str().trim().to_string();
            (!key.is_empty() && !value.is_empty()).then_some((key, value))
        })
        .collect();
    let number = |key: &str| fields.get(key).and_then(|value| first_float(value));

    let percent_raw = PERCENT_KEYS.iter().find_map(|key| number(key));
    let voltage = VOLTAGE_KEYS.iter().find_map(|key| number(key));

    let mut percent = normalize_percent(percent_raw);
    match percent {
        None => {
            if let (Some(charge), Some(capacity)) = (number("charge"), number("capacity")) {
                if capacity > 0.0 {
                    percent = normalize_percent(Some(charge / capacity * 100.0));
                }
            }
        }
        Some(value) if value <= 0.0 && voltage.is_some() => percent = None,
        Some(_) => {}
    }

    let mut estimated = false;
    if percent.is_none() {
        percent = estimate_from_voltage(voltage);
        estimated = percent.is_some();
    }

    let Some(percent) = percent else {
        return battery_result(
            TestStatus::Warning,
            "unknown",
            "Read /battery but could not extract percentage or usable voltage.".to_string(),
            elapsed_ms,
        );
    };

    let status = if percent <= LOW_BATTERY_ERROR_PERCENT {
        TestStatus::Error
    } else if percent <= LOW_BATTERY_WARNING_PERCENT {
        TestStatus::Warning
    } else {
        TestStatus::Ok
    };

    let text = format!("{}%", percent.round() as i64);
    let mut details = if estimated {
        format!(
            "Battery {text} estimated from voltage ({VOLTAGE_EMPTY:.1}V=0%, {VOLTAGE_FULL:.1}V=100%)."
        )
    } else {
        format!("Battery {text} from /battery topic.")
    };
    if let Some(voltage) = voltage {
        details.push_str(&format!(" Voltage {voltage:.2}V."));
    }

    battery_result(status, &text, details, elapsed_ms)
}

fn battery_result(status: TestStatus, value: &str, details: String, ms: u64) -> RuntimeTestResult {
    RuntimeTestResult {
        status,
        value: value.to_string(),
        details,
        ms,
        checked_at: Utc::now(),
        source: ResultSource::AutoMonitor,
    }
}

fn first_float(text: &str) -> Option<f64> {
    FLOAT.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Fractions are scaled to percent, then clamped to `0..=100`.
fn normalize_percent(raw: Option<f64>) -> Option<f64> {
    let mut value = raw?;
    if value <= 1.0 {
        value *= 100.0;
    }
    Some(value.clamp(0.0, 100.0))
}

fn estimate_from_voltage(voltage: Option<f64>) -> Option<f64> {
    let voltage = voltage?;
    let ratio = (voltage - VOLTAGE_EMPTY) / (VOLTAGE_FULL - VOLTAGE_EMPTY);
    Some((ratio * 100.0).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_field() {
        let result = parse_battery("header:\n  seq: 4\nvoltage: 12.31\npercentage: 0.82\n---\n", 5);
        assert_eq!(result.status, TestStatus::Ok);
        assert_eq!(result.value, "82%");
        assert_eq!(result.details, "Battery 82% from /battery topic. Voltage 12.31V.");
        assert_eq!(result.ms, 5);
    }

    #[test]
    fn test_thresholds() {
        assert_eq!(parse_battery("percentage: 14\n", 0).status, TestStatus::Error);
        assert_eq!(parse_battery("percentage: 25\n", 0).status, TestStatus::Warning);
        assert_eq!(parse_battery("percentage: 31\n", 0).status, TestStatus::Ok);
        assert_eq!(parse_battery("percentage: 150\n", 0).value, "100%");
    }

    #[test]
    fn test_voltage_estimate_when_percentage_is_zero() {
        let result = parse_battery("percentage: 0.0\nvoltage: 11.7\n", 0);
        assert_eq!(result.value, "50%");
        assert!(result.details.starts_with("Battery 50% estimated from voltage (10.8V=0%, 12.6V=100%)."));
        assert!(result.details.ends_with("Voltage 11.70V."));
    }

    #[test]
    fn test_charge_over_capacity() {
        let result = parse_battery("charge: 3.0\ncapacity: 4.0\n", 0);
        assert_eq!(result.value, "75%");
    }

    #[test]
    fn test_ros_errors_and_garbage() {
        let result = parse_battery("ERROR: Unable to communicate with master!", 0);
        assert_eq!(result.status, TestStatus::Error);
        assert_eq!(result.value, "unavailable");

        let result = parse_battery("nothing useful here", 0);
        assert_eq!(result.status, TestStatus::Warning);
        assert_eq!(result.value, "unknown");
    }
}
