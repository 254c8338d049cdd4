//! Pipeline processor
//!
//! One pipeline run reads a source, runs the records through the
//! transform, validate and enrich stages, and writes what is left to a
//! destination:
//!
//! ```yaml
//! id: orders-nightly
//! continueOnError: true
//! batchSize: 200
//! transforms:
//!   - rename: { order_id: id }
//!   - cast: { total: Number }
//! validation:
//!   rules:
//!     - { field: email, rule: required }
//! enrichment:
//!   enrichers:
//!     - type: metadata
//! ```
//!
//! Connectors are resolved and every stage is compiled before anything is
//! read, so a configuration error fails the run without I/O.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use conflux_core::connectors::ReadQuery;
use conflux_core::enrichment::EnrichmentConfig;
use conflux_core::transforms::TransformConfig;
use conflux_core::validation::ValidationConfig;
use conflux_core::{DestinationDefinition, Error, ErrorKind, Record, Result, SchemaCatalog, SourceDefinition};

use crate::engine::Services;
use crate::error::FailureDetail;
use crate::result::{PipelineRunResult, PipelineRunTracker, RunStatus, Stage, StageResult, elapsed_ms};
use crate::stages::extract::source_query;
use crate::stages::{Enrichment, Extractor, Loader, StageContext, Transformer, Validator};
use crate::telemetry::{EventKind, EventScope};

/// What a pipeline run does between extract and load
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Pipeline id; `<source>-><destination>` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Transforms in order
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,

    /// Validation applied after the transforms
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationConfig>,

    /// Enrichers applied to valid records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentConfig>,

    /// Skip failing records instead of aborting; the project default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on_error: Option<bool>,

    /// Records per destination write; the project default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Read parameters for the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ReadQuery>,
}

/// Compiled stages of one run
struct Plan {
    extractor: Extractor,
    transformer: Transformer,
    validator: Validator,
    enrichment: Enrichment,
    loader: Loader,
    catalog: SchemaCatalog,
    continue_on_error: bool,
}

/// Runs pipelines against shared services
#[derive(Debug, Clone)]
pub struct PipelineProcessor {
    services: Arc<Services>,
}

impl PipelineProcessor {
    /// Processor over `services`
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Run one pipeline to a terminal status
    ///
    /// Never returns an error: every failure ends up in the result.
    pub async fn run(
        &self,
        source: &SourceDefinition,
        destination: &DestinationDefinition,
        config: &PipelineConfig,
        cancel: &CancellationToken,
    ) -> PipelineRunResult {
        let run_id = Uuid::new_v4().to_string();
        let pipeline_id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("{}->{}", source.id, destination.id));
        let ctx = self
            .services
            .stage_context(EventScope::run(&run_id), cancel.clone());
        let mut tracker = PipelineRunTracker::start(&run_id, &pipeline_id);

        tracing::info!(run_id = %run_id, pipeline = %pipeline_id, "pipeline run started");
        ctx.resilience.telemetry().emit(
            ctx.scope
                .event(EventKind::RunStarted)
                .with("pipelineId", pipeline_id.as_str())
                .with("sourceId", source.id.as_str())
                .with("destinationId", destination.id.as_str()),
        );

        let status = match self.plan(source, destination, config) {
            Ok(plan) => execute(&plan, &ctx, &mut tracker).await,
            Err(e) => {
                tracker.push_error(FailureDetail::from_error(&e).at("setup"));
                tracing::error!(run_id = %run_id, error = %e, "pipeline setup failed");
                RunStatus::Failed
            }
        };
        let result = tracker.finish(status);

        ctx.resilience.telemetry().emit(
            ctx.scope
                .event(EventKind::RunFinished)
                .with("pipelineId", pipeline_id.as_str())
                .with("status", result.status.to_string())
                .with("recordsIn", result.records_in)
                .with("recordsOut", result.records_out)
                .with("durationMs", result.duration_ms),
        );
        match result.status {
            RunStatus::Failed => tracing::error!(
                run_id = %run_id,
                records_in = result.records_in,
                records_out = result.records_out,
                "pipeline run failed"
            ),
            status => tracing::info!(
                run_id = %run_id,
                status = %status,
                records_in = result.records_in,
                records_out = result.records_out,
                rejected = result.rejected,
                skipped = result.skipped,
                duration_ms = result.duration_ms,
                "pipeline run finished"
            ),
        }
        result
    }

    fn plan(
        &self,
        source: &SourceDefinition,
        destination: &DestinationDefinition,
        config: &PipelineConfig,
    ) -> Result<Plan> {
        let services = &self.services;
        let base = services.base_path.as_deref();
        let source_connector = services.registry.source(source, base)?;
        let destination_connector = services.registry.destination(destination, base)?;

        let mut catalog = (*services.catalog).clone();
        let mut validation = config.validation.clone().unwrap_or_default();
        if let Some(schema) = &source.schema {
            catalog.insert(schema.clone());
            validation.schema_id.get_or_insert_with(|| schema.id.clone());
        }

        Ok(Plan {
            extractor: Extractor::new(source_connector, source_query(source, config.query.as_ref())),
            transformer: Transformer::new(&config.transforms)?,
            validator: Validator::new(&validation, &source.validation_rules)?,
            enrichment: Enrichment::new(&config.enrichment.clone().unwrap_or_default())?,
            loader: Loader::new(
                destination_connector,
                config.batch_size.unwrap_or(services.pipeline.batch_size),
            ),
            catalog,
            continue_on_error: config
                .continue_on_error
                .unwrap_or(services.pipeline.continue_on_error),
        })
    }
}

/// Bookkeeping for the stage in progress
struct StageRun<'a> {
    ctx: &'a StageContext,
    result: StageResult,
    clock: tokio::time::Instant,
}

impl<'a> StageRun<'a> {
    fn begin(ctx: &'a StageContext, stage: Stage, records_in: usize) -> Self {
        tracing::debug!(run_id = %ctx.scope.run_id, stage = stage.name(), records_in, "stage started");
        ctx.resilience.telemetry().emit(
            ctx.scope
                .event(EventKind::StageStarted)
                .with("stage", stage.name())
                .with("recordsIn", records_in),
        );
        Self {
            ctx,
            result: StageResult::new(stage, records_in),
            clock: tokio::time::Instant::now(),
        }
    }

    fn end(mut self, tracker: &mut PipelineRunTracker) {
        self.result.duration_ms = elapsed_ms(self.clock);
        let result = &self.result;
        self.ctx.resilience.telemetry().emit(
            self.ctx
                .scope
                .event(EventKind::StageFinished)
                .with("stage", result.stage.name())
                .with("success", result.success)
                .with("recordsOut", result.records_out)
                .with("durationMs", result.duration_ms),
        );
        tracker.push_stage(self.result);
    }

    /// Record a fatal stage error and the status it ends the run with
    fn fail(mut self, tracker: &mut PipelineRunTracker, error: Error) -> RunStatus {
        let stage = self.result.stage.name();
        tracing::error!(run_id = %self.ctx.scope.run_id, stage, error = %error, "stage failed");
        let detail = FailureDetail::from_error(&error).at(stage);
        self.result.success = false;
        self.result.errors.push(detail.clone());
        tracker.push_error(detail);
        self.end(tracker);
        match error.kind() {
            ErrorKind::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }
}

fn cancelled(ctx: &StageContext, tracker: &mut PipelineRunTracker, before: Stage) -> bool {
    if !ctx.cancel.is_cancelled() {
        return false;
    }
    tracing::info!(run_id = %ctx.scope.run_id, before = before.name(), "pipeline run cancelled");
    tracker.push_error(FailureDetail::from_error(&Error::Cancelled).at(before.name()));
    true
}

async fn execute(plan: &Plan, ctx: &StageContext, tracker: &mut PipelineRunTracker) -> RunStatus {
    let mut partial = false;

    if cancelled(ctx, tracker, Stage::Extract) {
        return RunStatus::Cancelled;
    }
    let mut stage = StageRun::begin(ctx, Stage::Extract, 0);
    let records: Vec<Record> = match plan.extractor.extract(ctx).await {
        Ok(extraction) => {
            stage.result.attempts = extraction.attempts;
            stage.result.records_out = extraction.records.len();
            if let Some(e) = &extraction.interrupted {
                partial = true;
                let detail = FailureDetail::from_error(e).at(Stage::Extract.name());
                stage.result.errors.push(detail.clone());
                tracker.push_error(detail);
            }
            stage.end(tracker);
            extraction.records
        }
        Err(e) => return stage.fail(tracker, e),
    };

    if cancelled(ctx, tracker, Stage::Transform) {
        return RunStatus::Cancelled;
    }
    let mut stage = StageRun::begin(ctx, Stage::Transform, records.len());
    let records = match plan.transformer.transform(records, plan.continue_on_error) {
        Ok(out) => {
            stage.result.records_out = out.records.len();
            stage.result.skipped = out.skipped();
            partial |= !out.failures.is_empty();
            stage.result.errors = out.failures;
            stage.end(tracker);
            out.records
        }
        Err(e) => return stage.fail(tracker, e),
    };

    if cancelled(ctx, tracker, Stage::Validate) {
        return RunStatus::Cancelled;
    }
    let mut stage = StageRun::begin(ctx, Stage::Validate, records.len());
    let records = match plan.validator.validate(records, &plan.catalog) {
        Ok(out) => {
            stage.result.records_out = out.valid.len();
            stage.result.rejected = out.rejected;
            stage.result.rejections = out.rejections;
            stage.end(tracker);
            out.valid
        }
        Err(e) => return stage.fail(tracker, e),
    };

    if cancelled(ctx, tracker, Stage::Enrich) {
        return RunStatus::Cancelled;
    }
    let mut stage = StageRun::begin(ctx, Stage::Enrich, records.len());
    let records = if plan.enrichment.is_empty() {
        stage.result.records_out = records.len();
        stage.end(tracker);
        records
    } else {
        match plan
            .enrichment
            .enrich(records, ctx, plan.continue_on_error)
            .await
        {
            Ok(out) => {
                stage.result.records_out = out.records.len();
                stage.result.skipped = out.failures.len();
                stage.result.attempts = out.attempts;
                partial |= !out.failures.is_empty();
                stage.result.errors = out.failures;
                stage.end(tracker);
                out.records
            }
            Err(e) => return stage.fail(tracker, e),
        }
    };

    if cancelled(ctx, tracker, Stage::Load) {
        return RunStatus::Cancelled;
    }
    let mut stage = StageRun::begin(ctx, Stage::Load, records.len());
    let out = match plan.loader.load(&records, ctx, plan.continue_on_error).await {
        Ok(out) => out,
        Err(e) => return stage.fail(tracker, e),
    };
    stage.result.records_out = out.written;
    stage.result.attempts = out.attempts;
    stage.result.errors = out.failures;
    if out.failed > 0 {
        partial = true;
        stage.result.errors.push(
            FailureDetail::from_error(&Error::Write {
                target: plan.loader.target().to_string(),
                message: format!("{} records not written", out.failed),
            })
            .at(Stage::Load.name()),
        );
    }
    if let Some(e) = out.aborted {
        return stage.fail(tracker, e);
    }
    if out.cancelled {
        stage.result.success = false;
        stage.end(tracker);
        tracker.push_error(FailureDetail::from_error(&Error::Cancelled).at(Stage::Load.name()));
        return RunStatus::Cancelled;
    }
    stage.end(tracker);

    if partial {
        RunStatus::PartiallyFailed
    } else {
        RunStatus::Succeeded
    }
}
