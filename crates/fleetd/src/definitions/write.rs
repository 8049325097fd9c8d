//! Execution of a single command step.

use std::collections::HashMap;
use std::time::Instant;

use fleetd_protocol::{CommandRecord, StepRecord, TestStatus};
use log::debug;
use serde_json::Value;

use super::CommandExec;
use crate::catalog::{CommandPrimitive, ExecuteStep, ValueRef, Vars, primitive_token, value_text};
use crate::error::{FleetError, FleetResult};

/// Output cache shared by every step of one batch, keyed `"{scope}:{reuseKey}"`.
pub type OutputCache = HashMap<String, String>;

/// Audit records of one executed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: StepRecord,
    pub command: CommandRecord,
}

/// Runs steps against a primitive table.
pub struct StepWriter<'a> {
    primitives: &'a HashMap<String, CommandPrimitive>,
}

impl<'a> StepWriter<'a> {
    pub fn new(primitives: &'a HashMap<String, CommandPrimitive>) -> Self {
        Self { primitives }
    }

    /// Resolve the command text of a step. A bare `$name$` token is replaced
    /// by the primitive's command, anything else is used as is.
    pub fn resolve_command(
        &self,
        raw: &ValueRef<String>,
        vars: &Vars,
    ) -> FleetResult<(String, Option<&'a CommandPrimitive>)> {
        let command = match raw {
            ValueRef::Literal(text) => text.trim().to_string(),
            ValueRef::Ref { name } => vars
                .get(name.trim())
                .map(value_text)
                .unwrap_or_default()
                .trim()
                .to_string(),
        };
        if command.is_empty() {
            return Err(FleetError::execution("Command is empty"));
        }

        let Some(primitive_id) = primitive_token(&command) else {
            return Ok((command, None));
        };
        let primitive = self.primitives.get(primitive_id).ok_or_else(|| {
            FleetError::execution(format!("Unknown command primitive '{primitive_id}'"))
        })?;
        let resolved = primitive.command.trim();
        if resolved.is_empty() {
            return Err(FleetError::execution(format!(
                "Command primitive '{primitive_id}' has empty command"
            )));
        }
        Ok((resolved.to_string(), Some(primitive)))
    }

    /// Execute `step`, storing its output under `saveAs` and the reuse key.
    pub async fn execute(
        &self,
        step: &ExecuteStep,
        vars: &mut Vars,
        run_scope: &str,
        cache: &mut OutputCache,
        exec: &dyn CommandExec,
    ) -> FleetResult<StepOutcome> {
        let (command, primitive) = self.resolve_command(&step.command, vars)?;

        let timeout_sec = step
            .timeout_sec
            .as_ref()
            .and_then(|value| resolve_f64(value, vars))
            .or_else(|| primitive.and_then(|p| p.timeout_sec));
        let retries = step
            .retries
            .as_ref()
            .and_then(|value| resolve_u32(value, vars))
            .or_else(|| primitive.and_then(|p| p.retries))
            .unwrap_or(0);

        let cache_key = step
            .reuse_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(|key| format!("{run_scope}:{key}"));

        if let Some(output) = cache_key.as_ref().and_then(|key| cache.get(key)) {
            debug!("Step '{}' reused cached output", step.id);
            let output = output.clone();
            save_output(step, vars, &output);
            return Ok(StepOutcome {
                step: step_record(&step.id, "Reused cached command output.", 0, &output, true),
                command: command_record(&step.id, &command, timeout_sec, &output, 0, true),
            });
        }

        let started = Instant::now();
        let mut last_error = None;
        let mut output = String::new();
        for attempt in 0..=retries {
            match exec.run(&command, timeout_sec).await {
                Ok(text) => {
                    output = text;
                    last_error = None;
                    break;
                }
                Err(err) => {
                    debug!(
                        "Step '{}' attempt {}/{} failed: {}",
                        step.id,
                        attempt + 1,
                        retries + 1,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }
        let elapsed = started.elapsed().as_millis() as u64;

        if let Some(err) = last_error {
            return Err(match err {
                FleetError::Connectivity { robot_id, message } => FleetError::Connectivity {
                    robot_id,
                    message: format!("Command failed: {message}"),
                },
                other => FleetError::execution(format!("Command failed: {other}")),
            });
        }

        save_output(step, vars, &output);
        if let Some(key) = cache_key {
            cache.insert(key, output.clone());
        }

        Ok(StepOutcome {
            step: step_record(&step.id, "Command executed.", elapsed, &output, false),
            command: command_record(&step.id, &command, timeout_sec, &output, elapsed, false),
        })
    }
}

fn save_output(step: &ExecuteStep, vars: &mut Vars, output: &str) {
    if let Some(name) = step
        .save_as
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        vars.insert(name.to_string(), Value::String(output.to_string()));
    }
}

fn resolve_f64(value: &ValueRef<f64>, vars: &Vars) -> Option<f64> {
    match value {
        ValueRef::Literal(number) => Some(*number),
        ValueRef::Ref { name } => match vars.get(name.trim())? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        },
    }
}

fn resolve_u32(value: &ValueRef<u32>, vars: &Vars) -> Option<u32> {
    match value {
        ValueRef::Literal(number) => Some(*number),
        ValueRef::Ref { name } => match vars.get(name.trim())? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        },
    }
}

fn step_record(id: &str, details: &str, ms: u64, output: &str, used_cache: bool) -> StepRecord {
    StepRecord {
        id: id.to_string(),
        status: TestStatus::Ok,
        value: "ok".to_string(),
        details: details.to_string(),
        ms,
        output: output.to_string(),
        used_cache,
    }
}

fn command_record(
    id: &str,
    command: &str,
    timeout_sec: Option<f64>,
    output: &str,
    duration_ms: u64,
    used_cache: bool,
) -> CommandRecord {
    CommandRecord {
        id: id.to_string(),
        command: command.to_string(),
        timeout_sec,
        output: output.to_string(),
        exit_code: 0,
        ok: true,
        duration_ms,
        used_cache,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records calls and fails the first `failures` of them.
    #[derive(Default)]
    struct FakeExec {
        calls: Mutex<Vec<(String, Option<f64>)>>,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl CommandExec for FakeExec {
        async fn run(&self, command: &str, timeout_sec: Option<f64>) -> FleetResult<String> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), timeout_sec));
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(FleetError::execution("boom"));
            }
            Ok(format!("output of {command}"))
        }
    }

    fn primitives() -> HashMap<String, CommandPrimitive> {
        let primitive: CommandPrimitive = serde_json::from_value(json!({
            "id": "topics",
            "command": "rostopic list",
            "timeoutSec": 7,
            "retries": 2
        }))
        .unwrap();
        HashMap::from([("topics".to_string(), primitive)])
    }

    fn step(value: serde_json::Value) -> ExecuteStep {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_primitive_token_resolves_to_stored_command() {
        let primitives = primitives();
        let writer = StepWriter::new(&primitives);
        let vars = Vars::new();

        let (command, primitive) = writer
            .resolve_command(&ValueRef::Literal("$topics$".to_string()), &vars)
            .unwrap();
        assert_eq!(command, "rostopic list");
        assert!(primitive.is_some());

        let (command, primitive) = writer
            .resolve_command(&ValueRef::Literal("echo $topics$".to_string()), &vars)
            .unwrap();
        assert_eq!(command, "echo $topics$");
        assert!(primitive.is_none());

        let err = writer
            .resolve_command(&ValueRef::Literal("$nope$".to_string()), &vars)
            .unwrap_err();
        assert_eq!(err.to_string(), "Unknown command primitive 'nope'");
    }

    #[tokio::test]
    async fn test_step_values_take_precedence_over_primitive() {
        let primitives = primitives();
        let writer = StepWriter::new(&primitives);
        let exec = FakeExec::default();
        let mut vars = Vars::new();
        vars.insert("slow".to_string(), json!(30));
        let mut cache = OutputCache::new();

        let outcome = writer
            .execute(
                &step(json!({"id": "a", "command": "$topics$", "timeoutSec": {"ref": "slow"}, "saveAs": "out"})),
                &mut vars,
                "scope",
                &mut cache,
                &exec,
            )
            .await
            .unwrap();
        assert_eq!(outcome.command.timeout_sec, Some(30.0));
        assert_eq!(vars["out"], json!("output of rostopic list"));

        writer
            .execute(
                &step(json!({"id": "b", "command": "$topics$"})),
                &mut vars,
                "scope",
                &mut cache,
                &exec,
            )
            .await
            .unwrap();
        let calls = exec.calls.lock().unwrap().clone();
        assert_eq!(calls[1].1, Some(7.0));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let primitives = primitives();
        let writer = StepWriter::new(&primitives);
        let exec = FakeExec {
            failures: Mutex::new(2),
            ..FakeExec::default()
        };
        let mut vars = Vars::new();
        let mut cache = OutputCache::new();

        let outcome = writer
            .execute(
                &step(json!({"id": "a", "command": "$topics$"})),
                &mut vars,
                "scope",
                &mut cache,
                &exec,
            )
            .await
            .unwrap();
        assert_eq!(outcome.step.details, "Command executed.");
        assert_eq!(exec.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let primitives = primitives();
        let writer = StepWriter::new(&primitives);
        let exec = FakeExec {
            failures: Mutex::new(5),
            ..FakeExec::default()
        };
        let mut vars = Vars::new();
        let mut cache = OutputCache::new();

        let err = writer
            .execute(
                &step(json!({"id": "a", "command": "uptime", "retries": 1})),
                &mut vars,
                "scope",
                &mut cache,
                &exec,
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Command failed: boom");
        assert_eq!(exec.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reuse_key_hits_cache_within_scope() {
        let primitives = primitives();
        let writer = StepWriter::new(&primitives);
        let exec = FakeExec::default();
        let mut vars = Vars::new();
        let mut cache = OutputCache::new();
        let shared = json!({"id": "list", "command": "$topics$", "reuseKey": "topics", "saveAs": "t"});

        writer
            .execute(&step(shared.clone()), &mut vars, "run-1", &mut cache, &exec)
            .await
            .unwrap();
        let again = writer
            .execute(&step(shared.clone()), &mut vars, "run-1", &mut cache, &exec)
            .await
            .unwrap();
        assert!(again.step.used_cache);
        assert_eq!(again.step.details, "Reused cached command output.");
        assert_eq!(exec.calls.lock().unwrap().len(), 1);

        writer
            .execute(&step(shared), &mut vars, "run-2", &mut cache, &exec)
            .await
            .unwrap();
        assert_eq!(exec.calls.lock().unwrap().len(), 2);
    }
}
