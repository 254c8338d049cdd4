//! Workflow commands

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

use conflux_core::Config;
use conflux_runtime::workflow::graph;
use conflux_runtime::{
    Definitions, Engine, RunStatus, WorkflowRequest, WorkflowRunResult, load_workflow_request,
};

use super::{cancel_on_ctrl_c, load_project, print_failures};

/// Load a workflow request and add the project's definitions to it
fn load_request(config: &Config, file: &Path) -> Result<WorkflowRequest> {
    let mut request = load_workflow_request(file)
        .with_context(|| format!("Failed to load workflow {}", file.display()))?;
    let project = Definitions::from_project(config).context("Failed to load project definitions")?;
    request.definitions.merge(project);
    Ok(request)
}

/// Graph checks plus definition references
pub fn check(request: &WorkflowRequest) -> conflux_runtime::Result<()> {
    graph::validate(&request.workflow)?;
    graph::check_references(&request.workflow, &request.definitions)
}

/// Run a workflow with extra context variables
pub async fn run(project: &Path, file: &Path, vars: Vec<(String, Value)>, json: bool) -> Result<()> {
    let config = load_project(project)?;
    let mut request = load_request(&config, file)?;
    request.context.extend(vars);

    tracing::info!(
        project = %config.project.name,
        workflow = %request.workflow.id,
        steps = request.workflow.steps.len(),
        "running workflow"
    );
    let engine = Engine::new(&config);
    let result = engine.run_workflow(&request, &cancel_on_ctrl_c()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    match result.status {
        RunStatus::Failed => anyhow::bail!("workflow run {} failed", result.run_id),
        RunStatus::Cancelled => anyhow::bail!("workflow run {} was cancelled", result.run_id),
        _ => Ok(()),
    }
}

/// Check a workflow without running it
pub fn validate(project: &Path, file: &Path) -> Result<()> {
    let config = load_project(project)?;
    let request = load_request(&config, file)?;
    check(&request).with_context(|| format!("Workflow '{}' is invalid", request.workflow.id))?;
    println!(
        "✓ Workflow '{}' is valid ({} steps, starts at '{}')",
        request.workflow.id,
        request.workflow.steps.len(),
        request.workflow.start_step_id
    );
    Ok(())
}

fn print_summary(result: &WorkflowRunResult) {
    println!(
        "{} {} in {} ms",
        result.workflow_id, result.status, result.duration_ms
    );
    for step in &result.steps {
        let mark = if step.success { "✓" } else { "✗" };
        let next = step.next_step_id.as_deref().unwrap_or("-");
        println!(
            "  {mark} {:<16} {:<9} {:>7} records  -> {next}",
            step.step_id,
            step.step_type.to_string(),
            step.output_records
        );
    }
    println!("  records: {} in, {} out", result.records_in, result.records_out);
    print_failures(&result.errors);
}
