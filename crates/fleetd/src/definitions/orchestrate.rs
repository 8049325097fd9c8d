//! Runs a definition: every step in order, then every check.

use std::collections::HashMap;

use fleetd_protocol::{CommandRecord, ReadVerdict, StepRecord, TestStatus};
use log::debug;
use serde_json::json;

use super::read::evaluate;
use super::write::{OutputCache, StepWriter};
use super::{CommandExec, EventSink};
use crate::catalog::{CheckSpec, CommandPrimitive, ExecuteStep, ResultTemplate, Vars};
use crate::error::FleetError;

/// Result selected for one check.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: TestStatus,
    pub value: String,
    pub details: String,
    pub ms: u64,
    pub read: Option<ReadVerdict>,
}

/// Everything a successful run produced.
#[derive(Debug, Clone, Default)]
pub struct DefinitionRun {
    pub steps: Vec<StepRecord>,
    pub commands: Vec<CommandRecord>,
    pub checks: HashMap<String, CheckOutcome>,
    pub vars: Vars,
}

/// A step failed. Carries the steps recorded up to and including the failure.
#[derive(Debug)]
pub struct DefinitionFailure {
    pub error: FleetError,
    pub steps: Vec<StepRecord>,
    pub commands: Vec<CommandRecord>,
}

/// What to run.
pub struct RunPlan<'p> {
    pub execute: &'p [ExecuteStep],
    pub checks: &'p [CheckSpec],
    /// Initial variable scope.
    pub params: Vars,
    /// Namespace for reuse keys.
    pub run_scope: &'p str,
    pub dry_run: bool,
}

pub struct Orchestrator<'a> {
    writer: StepWriter<'a>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(primitives: &'a HashMap<String, CommandPrimitive>) -> Self {
        Self {
            writer: StepWriter::new(primitives),
        }
    }

    pub async fn run(
        &self,
        plan: RunPlan<'_>,
        exec: &dyn CommandExec,
        events: &dyn EventSink,
        cache: &mut OutputCache,
    ) -> Result<DefinitionRun, DefinitionFailure> {
        let mut run = DefinitionRun {
            vars: plan.params,
            ..DefinitionRun::default()
        };

        if plan.dry_run {
            for check in plan.checks {
                run.checks.insert(
                    check.id.clone(),
                    CheckOutcome {
                        status: TestStatus::Warning,
                        value: "pending".to_string(),
                        details: "Dry-run mode: execution skipped.".to_string(),
                        ms: 0,
                        read: None,
                    },
                );
            }
            return Ok(run);
        }

        for step in plan.execute {
            match self
                .writer
                .execute(step, &mut run.vars, plan.run_scope, cache, exec)
                .await
            {
                Ok(outcome) => {
                    events.emit(
                        "step_executed",
                        format!("Executed step '{}'.", outcome.step.id),
                        json!({"step": outcome.step, "command": outcome.command}),
                    );
                    run.steps.push(outcome.step);
                    run.commands.push(outcome.command);
                }
                Err(error) => {
                    let failed = StepRecord {
                        id: step.id.clone(),
                        status: TestStatus::Error,
                        value: "command_error".to_string(),
                        details: error.to_string(),
                        ms: 0,
                        output: String::new(),
                        used_cache: false,
                    };
                    events.emit(
                        "step_failed",
                        format!("Step '{}' failed: {}", step.id, error),
                        json!({"step": failed}),
                    );
                    run.steps.push(failed);
                    return Err(DefinitionFailure {
                        error,
                        steps: run.steps,
                        commands: run.commands,
                    });
                }
            }
        }

        for check in plan.checks {
            let verdict = check.read.as_ref().map(|spec| evaluate(spec, &run.vars));
            let passed = verdict.as_ref().is_some_and(|v| v.passed);
            let outcome = if passed {
                select_branch(&check.on_pass, TestStatus::Ok, verdict)
            } else {
                select_branch(&check.on_fail, TestStatus::Error, verdict)
            };
            debug!("Check '{}' {}", check.id, if passed { "passed" } else { "failed" });
            events.emit(
                "check_evaluated",
                format!(
                    "Check '{}' {}.",
                    check.id,
                    if passed { "passed" } else { "failed" }
                ),
                json!({
                    "checkId": check.id,
                    "passed": passed,
                    "status": outcome.status,
                    "value": outcome.value,
                    "details": outcome.details,
                }),
            );
            run.checks.insert(check.id.clone(), outcome);
        }

        Ok(run)
    }
}

fn select_branch(
    template: &ResultTemplate,
    default_status: TestStatus,
    read: Option<ReadVerdict>,
) -> CheckOutcome {
    CheckOutcome {
        status: template.status.unwrap_or(default_status),
        value: non_empty(template.value.as_deref()).unwrap_or_else(|| "n/a".to_string()),
        details: non_empty(template.details.as_deref())
            .unwrap_or_else(|| "No detail available".to_string()),
        ms: 0,
        read,
    }
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
