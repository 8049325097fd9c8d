//! Background health monitor.
//!
//! Every tick the monitor visits each robot that is neither busy nor
//! recently used by an operator. Unknown or offline robots get a short
//! reachability probe; reachable robots get battery and, in extended mode,
//! topic snapshots on their own intervals. A robot coming back online gets
//! one recovery test run.

pub mod config;
pub mod worker;

pub use config::{MonitorControl, Signal};
pub use worker::{AutoMonitor, MonitorDeps};
