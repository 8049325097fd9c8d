//! Interpreter for test and fix definitions.
//!
//! - [`read`] evaluates check predicates against the variable scope.
//! - [`write`] executes one command step with retries and output reuse.
//! - [`orchestrate`] runs a definition's steps in order, then its checks.

pub mod orchestrate;
pub mod read;
pub mod write;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FleetResult;

pub use orchestrate::{CheckOutcome, DefinitionFailure, DefinitionRun, Orchestrator, RunPlan};
pub use read::evaluate;
pub use write::{OutputCache, StepOutcome, StepWriter};

/// Something that can run a shell command on a robot.
#[async_trait]
pub trait CommandExec: Send + Sync {
    async fn run(&self, command: &str, timeout_sec: Option<f64>) -> FleetResult<String>;
}

/// Receiver for progress events of a definition run.
pub trait EventSink: Send + Sync {
    fn emit(&self, kind: &str, message: String, data: Value);
}

/// Discards every event.
pub struct NoEvents;

impl EventSink for NoEvents {
    fn emit(&self, _kind: &str, _message: String, _data: Value) {}
}
