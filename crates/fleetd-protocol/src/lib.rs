//! Wire types for the fleetd core.
//!
//! Everything here is plain data: the HTTP/WebSocket layer serializes these
//! shapes to clients and the core produces them. All types serialize with
//! camelCase field names.

pub mod fixes;
pub mod monitor;
pub mod results;

pub use fixes::{FixJobEvent, FixJobRecord, FixJobStatus, FixResult, FixTestRun};
pub use monitor::{MonitorConfig, MonitorConfigPatch, MonitorMode};
pub use results::{
    ActivityPhase, CommandRecord, ReachabilityResult, ReadVerdict, ResultSource, RobotRuntimeView,
    RuntimeActivity, RuntimeTestResult, StepRecord, TestRunRaw, TestRunResult, TestStatus,
    TestSummary,
};
