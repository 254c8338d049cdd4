//! Workflow graph validation
//!
//! Runs before a workflow executes. Every problem found here is a
//! configuration error, so a malformed graph never starts.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use conflux_core::workflow::{StepKind, TERMINATE, Workflow, WorkflowStep};
use conflux_core::{Error, Result};

use crate::requests::Definitions;

/// Check the shape of a workflow graph
///
/// Rejects duplicate or reserved step ids, dangling transitions, branch
/// steps without a default, inputs nobody binds, and cycles through steps
/// that are neither branches nor bounded by `maxIterations`.
pub fn validate(workflow: &Workflow) -> Result<()> {
    if workflow.steps.is_empty() {
        return Err(invalid(workflow, "has no steps"));
    }

    let mut ids = HashSet::new();
    for step in &workflow.steps {
        if step.id.eq_ignore_ascii_case(TERMINATE) {
            return Err(invalid(workflow, format!("step id '{}' is reserved", step.id)));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(invalid(workflow, format!("duplicate step id '{}'", step.id)));
        }
    }

    if workflow.step(&workflow.start_step_id).is_none() {
        return Err(invalid(
            workflow,
            format!("start step '{}' does not exist", workflow.start_step_id),
        ));
    }

    let bindings: HashSet<&str> = workflow
        .steps
        .iter()
        .filter_map(|s| s.output_binding.as_deref())
        .collect();

    for step in &workflow.steps {
        for next in step.successors() {
            if !ids.contains(next) {
                return Err(invalid(
                    workflow,
                    format!("step '{}' transitions to unknown step '{next}'", step.id),
                ));
            }
        }
        if let StepKind::Branch(branch) = &step.kind
            && branch.default_step_id.is_none()
        {
            return Err(invalid(
                workflow,
                format!("branch step '{}' has no defaultStepId", step.id),
            ));
        }
        if step.max_iterations == Some(0) {
            return Err(invalid(
                workflow,
                format!("step '{}' has maxIterations 0", step.id),
            ));
        }
        if let Some(input) = &step.input
            && !bindings.contains(input.as_str())
        {
            return Err(invalid(
                workflow,
                format!("step '{}' reads '{input}', which no step binds", step.id),
            ));
        }
    }

    let steps: HashMap<&str, &WorkflowStep> =
        workflow.steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let reachable = reachable_from(&steps, &workflow.start_step_id);
    for step in &workflow.steps {
        if !reachable.contains(step.id.as_str()) {
            tracing::warn!(workflow = %workflow.id, step = %step.id, "step is unreachable");
            continue;
        }
        let bounded = matches!(step.kind, StepKind::Branch(_)) || step.max_iterations.is_some();
        if !bounded && on_cycle(&steps, step) {
            return Err(invalid(
                workflow,
                format!(
                    "step '{}' is on a cycle but is neither a Branch nor bounded by maxIterations",
                    step.id
                ),
            ));
        }
    }

    Ok(())
}

/// Check that every source and destination a workflow names is defined
pub fn check_references(workflow: &Workflow, definitions: &Definitions) -> Result<()> {
    for step in &workflow.steps {
        match &step.kind {
            StepKind::Extract(config) => {
                definitions.source(&config.source_id)?;
            }
            StepKind::Load(config) => {
                definitions.destination(&config.destination_id)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn invalid(workflow: &Workflow, message: impl AsRef<str>) -> Error {
    Error::config(format!("workflow '{}' {}", workflow.id, message.as_ref()))
}

fn reachable_from<'a>(steps: &HashMap<&'a str, &'a WorkflowStep>, start: &'a str) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(step) = steps.get(id) {
            queue.extend(step.successors());
        }
    }
    seen
}

/// Whether `step` can reach itself
fn on_cycle(steps: &HashMap<&str, &WorkflowStep>, step: &WorkflowStep) -> bool {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = step.successors();
    while let Some(id) = stack.pop() {
        if id == step.id {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(next) = steps.get(id) {
            stack.extend(next.successors());
        }
    }
    false
}
