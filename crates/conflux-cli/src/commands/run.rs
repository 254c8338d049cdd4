//! Run a pipeline request

use anyhow::{Context, Result};
use std::path::Path;

use conflux_runtime::{Engine, PipelineRunResult, RunStatus, load_pipeline_request};

use super::{cancel_on_ctrl_c, load_project, print_failures};

/// Run the pipeline in `request_path` against the project at `project`
pub async fn run(project: &Path, request_path: &Path, json: bool) -> Result<()> {
    let config = load_project(project)?;
    let request = load_pipeline_request(request_path).with_context(|| {
        format!("Failed to load pipeline request {}", request_path.display())
    })?;

    tracing::info!(
        project = %config.project.name,
        source = %request.source.id,
        destination = %request.destination.id,
        "running pipeline"
    );
    let engine = Engine::new(&config);
    let result = engine.run_pipeline(&request, &cancel_on_ctrl_c()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    match result.status {
        RunStatus::Failed => anyhow::bail!("pipeline run {} failed", result.run_id),
        RunStatus::Cancelled => anyhow::bail!("pipeline run {} was cancelled", result.run_id),
        _ => Ok(()),
    }
}

fn print_summary(result: &PipelineRunResult) {
    println!(
        "{} {} in {} ms",
        result.pipeline_id, result.status, result.duration_ms
    );
    for stage in &result.stages {
        println!(
            "  {:<9} {:>7} in {:>7} out  rejected {}  skipped {}",
            stage.stage.name(),
            stage.records_in,
            stage.records_out,
            stage.rejected,
            stage.skipped
        );
    }
    println!("  records: {} in, {} out", result.records_in, result.records_out);
    print_failures(&result.errors);
}
