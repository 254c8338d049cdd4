//! Workflow engine
//!
//! Walks the step graph from the start step. After each step:
//!
//! | Outcome | Next |
//! |---------|------|
//! | success | the branch's choice, else `onSuccess`; none completes the run |
//! | failure, `onFailure: terminate` | run fails |
//! | failure, `onFailure: <step>` | that step, with whatever the failed step produced |
//! | failure, `continueOnError` | `onSuccess` with no records |
//! | failure otherwise | run fails |
//!
//! Configuration errors and cancellation end the run whatever the step says.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conflux_core::workflow::{FailureTarget, Workflow};
use conflux_core::{Error, ErrorKind, Record};

use super::context::RunContext;
use super::graph;
use super::steps::StepProcessor;
use crate::engine::Services;
use crate::error::FailureDetail;
use crate::requests::Definitions;
use crate::result::{RunStatus, WorkflowRunResult, WorkflowRunTracker};
use crate::telemetry::{EventKind, EventScope};

/// Executes workflow documents
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    services: Arc<Services>,
}

impl WorkflowEngine {
    /// Engine over `services`
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Validate and run `workflow` to a terminal status
    ///
    /// Context variables start from the project `vars`, then the
    /// workflow's `variables`, then `initial_context`, later ones winning.
    pub async fn run(
        &self,
        workflow: &Workflow,
        definitions: &Definitions,
        initial_context: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> WorkflowRunResult {
        let run_id = Uuid::new_v4().to_string();
        let scope = EventScope::run(&run_id);
        let mut tracker = WorkflowRunTracker::start(&run_id, &workflow.id);

        let mut variables = self.services.vars.clone();
        variables.extend(workflow.variables.clone());
        variables.extend(initial_context);
        let mut context = RunContext::new(variables);

        tracing::info!(run_id = %run_id, workflow = %workflow.id, "workflow run started");
        self.services.resilience.telemetry().emit(
            scope
                .event(EventKind::RunStarted)
                .with("workflowId", workflow.id.as_str()),
        );

        let checked = graph::validate(workflow).and_then(|()| graph::check_references(workflow, definitions));
        let status = match checked {
            Ok(()) => {
                self.execute(workflow, definitions, &scope, &mut context, &mut tracker, cancel)
                    .await
            }
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "workflow rejected");
                tracker.push_error(FailureDetail::from_error(&e).at("setup"));
                RunStatus::Failed
            }
        };
        let result = tracker.finish(status, context.into_variables());

        self.services.resilience.telemetry().emit(
            scope
                .event(EventKind::RunFinished)
                .with("workflowId", workflow.id.as_str())
                .with("status", result.status.to_string())
                .with("steps", result.steps.len())
                .with("recordsOut", result.records_out)
                .with("durationMs", result.duration_ms),
        );
        match result.status {
            RunStatus::Failed => tracing::error!(
                run_id = %run_id,
                workflow = %workflow.id,
                path = ?result.path(),
                "workflow run failed"
            ),
            status => tracing::info!(
                run_id = %run_id,
                workflow = %workflow.id,
                status = %status,
                steps = result.steps.len(),
                records_out = result.records_out,
                duration_ms = result.duration_ms,
                "workflow run finished"
            ),
        }
        result
    }

    async fn execute(
        &self,
        workflow: &Workflow,
        definitions: &Definitions,
        scope: &EventScope,
        context: &mut RunContext,
        tracker: &mut WorkflowRunTracker,
        cancel: &CancellationToken,
    ) -> RunStatus {
        let budget = workflow
            .max_step_executions
            .unwrap_or(self.services.workflow.max_step_executions);
        let processor = StepProcessor::new(&self.services, definitions);
        let mut recovered = false;
        let mut output: Vec<Record> = Vec::new();
        let mut current = workflow.start_step_id.clone();

        loop {
            if cancel.is_cancelled() {
                tracing::info!(step = %current, "workflow run cancelled");
                tracker.push_error(FailureDetail::from_error(&Error::Cancelled).at(&current));
                return RunStatus::Cancelled;
            }
            let Some(step) = workflow.step(&current) else {
                let e = Error::config(format!("unknown step '{current}'"));
                tracker.push_error(FailureDetail::from_error(&e));
                return RunStatus::Failed;
            };

            let (count, total) = context.count_execution(&step.id);
            if total > budget {
                let e = Error::config(format!(
                    "workflow '{}' exceeded its budget of {budget} step executions",
                    workflow.id
                ));
                tracker.push_error(FailureDetail::from_error(&e).at(&step.id));
                return RunStatus::Failed;
            }
            if let Some(max) = step.max_iterations
                && count > max
            {
                let e = Error::config(format!("step '{}' exceeded maxIterations {max}", step.id));
                tracker.push_error(FailureDetail::from_error(&e).at(&step.id));
                return RunStatus::Failed;
            }

            let input = match &step.input {
                Some(name) => context.dataset(name).map(<[Record]>::to_vec).unwrap_or_default(),
                None => std::mem::take(&mut output),
            };
            let ctx = self
                .services
                .stage_context(scope.step(&step.id), cancel.clone());
            let mut outcome = processor.execute(step, input, context, &ctx).await;
            context.finish_step(&step.id, outcome.result.success, outcome.result.errors.len());
            recovered |= !outcome.result.errors.is_empty();

            let next = match outcome.error.take() {
                None => {
                    if let Some(binding) = &step.output_binding {
                        context.bind(binding, &outcome.records);
                    }
                    output = outcome.records;
                    outcome.result.next_step_id.clone().or_else(|| step.on_success.clone())
                }
                Some(error) => {
                    let route = match (error.kind(), &step.on_failure) {
                        (ErrorKind::Configuration | ErrorKind::Cancelled, _) => None,
                        (_, Some(FailureTarget::Step(id))) => Some((Some(id.clone()), outcome.records)),
                        (_, None) if step.continue_on_error => Some((step.on_success.clone(), Vec::new())),
                        _ => None,
                    };
                    let Some((next, records)) = route else {
                        tracker.push_error(step_failure(&step.id, &error));
                        tracker.push_step(outcome.result, outcome.loaded);
                        return match error.kind() {
                            ErrorKind::Cancelled => RunStatus::Cancelled,
                            _ => RunStatus::Failed,
                        };
                    };
                    tracing::warn!(step = %step.id, next = ?next, error = %error, "recovering from step failure");
                    output = records;
                    next
                }
            };

            outcome.result.next_step_id = next.clone();
            tracker.push_step(outcome.result, outcome.loaded);
            match next {
                Some(id) => current = id,
                None => break,
            }
        }

        if cancel.is_cancelled() {
            tracker.push_error(FailureDetail::from_error(&Error::Cancelled));
            RunStatus::Cancelled
        } else if recovered || tracker.any_step_failed() {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }
}

/// Run-level detail for a step failure that ended the run
fn step_failure(step_id: &str, error: &Error) -> FailureDetail {
    match error.kind() {
        ErrorKind::Configuration | ErrorKind::Cancelled => FailureDetail::from_error(error).at(step_id),
        _ => FailureDetail::from_error(&Error::WorkflowStepFailed {
            step_id: step_id.to_string(),
            message: error.to_string(),
        })
        .at(step_id),
    }
}
