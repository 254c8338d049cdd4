//! Step processors
//!
//! One handler per step type. Each wraps the matching stage and reports
//! success or failure in a [`StepOutcome`]; nothing here decides where the
//! run goes after a failure.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use conflux_core::validation::ValidationConfig;
use conflux_core::workflow::{BranchStepConfig, StepKind, WorkflowStep};
use conflux_core::{Error, Record, Result, SchemaCatalog};

use super::context::RunContext;
use crate::engine::Services;
use crate::error::FailureDetail;
use crate::requests::Definitions;
use crate::result::{WorkflowStepResult, elapsed_ms};
use crate::stages::extract::source_query;
use crate::stages::{
    Enrichment, Extractor, Loader, StageContext, Transformer, ValidationOutput, Validator,
};
use crate::telemetry::EventKind;

/// What one step execution produced
#[derive(Debug)]
pub struct StepOutcome {
    /// Step result; the engine fills in `next_step_id` unless a branch chose it
    pub result: WorkflowStepResult,
    /// Output records, possibly partial when the step failed
    pub records: Vec<Record>,
    /// Records written by a load step
    pub loaded: usize,
    /// Why the step failed
    pub error: Option<Error>,
}

/// What a handler produced before bookkeeping
#[derive(Default)]
struct Produced {
    records: Vec<Record>,
    loaded: usize,
    rejected: usize,
    skipped: usize,
    attempts: u32,
    errors: Vec<FailureDetail>,
    next: Option<String>,
    failure: Option<Error>,
}

impl Produced {
    fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }
}

/// Executes single workflow steps
pub struct StepProcessor<'a> {
    services: &'a Services,
    definitions: &'a Definitions,
    catalog: SchemaCatalog,
}

impl<'a> StepProcessor<'a> {
    /// Processor resolving sources and destinations from `definitions`
    ///
    /// Validate steps see the project schemas plus every source's schema.
    pub fn new(services: &'a Services, definitions: &'a Definitions) -> Self {
        let mut catalog = (*services.catalog).clone();
        for schema in definitions.sources.iter().filter_map(|s| s.schema.clone()) {
            catalog.insert(schema);
        }
        Self {
            services,
            definitions,
            catalog,
        }
    }

    /// Run `step` on `input`
    pub async fn execute(
        &self,
        step: &WorkflowStep,
        input: Vec<Record>,
        context: &RunContext,
        ctx: &StageContext,
    ) -> StepOutcome {
        let clock = tokio::time::Instant::now();
        let records_in = input.len();
        tracing::debug!(step = %step.id, step_type = %step.kind.step_type(), records_in, "step started");
        ctx.resilience.telemetry().emit(
            ctx.scope
                .event(EventKind::StepStarted)
                .with("stepType", step.kind.step_type().to_string())
                .with("recordsIn", records_in),
        );

        let produced = match self.dispatch(step, input, context, ctx).await {
            Ok(produced) => produced,
            Err(e) => Produced {
                failure: Some(e),
                ..Default::default()
            },
        };

        let mut result = WorkflowStepResult::new(&step.id, step.kind.step_type());
        result.output_records = produced.records.len();
        result.rejected = produced.rejected;
        result.skipped = produced.skipped;
        result.attempts = produced.attempts;
        result.errors = produced.errors;
        result.next_step_id = produced.next;
        if let Some(e) = &produced.failure {
            result.success = false;
            result.errors.push(FailureDetail::from_error(e).at(&step.id));
            tracing::warn!(step = %step.id, error = %e, "step failed");
        }
        result.duration_ms = elapsed_ms(clock);

        ctx.resilience.telemetry().emit(
            ctx.scope
                .event(EventKind::StepFinished)
                .with("stepType", step.kind.step_type().to_string())
                .with("success", result.success)
                .with("outputRecords", result.output_records)
                .with("durationMs", result.duration_ms),
        );
        StepOutcome {
            result,
            records: produced.records,
            loaded: produced.loaded,
            error: produced.failure,
        }
    }

    /// Check each record against the step's rules and its own source's rules
    fn validate_by_source(
        &self,
        config: &ValidationConfig,
        input: Vec<Record>,
    ) -> Result<ValidationOutput> {
        let mut validators: HashMap<String, Validator> = HashMap::new();
        let mut output = ValidationOutput::default();
        for record in input {
            let validator = match validators.entry(record.source_id.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let rules = self
                        .definitions
                        .source(entry.key())
                        .map_or(&[][..], |source| source.validation_rules.as_slice());
                    entry.insert(Validator::new(config, rules)?)
                }
            };
            output.absorb(validator.validate(vec![record], &self.catalog)?);
        }
        Ok(output)
    }

    async fn dispatch(
        &self,
        step: &WorkflowStep,
        input: Vec<Record>,
        context: &RunContext,
        ctx: &StageContext,
    ) -> Result<Produced> {
        let continue_on_error = step.continue_on_error || self.services.pipeline.continue_on_error;
        let base = self.services.base_path.as_deref();

        match &step.kind {
            StepKind::Extract(config) => {
                let source = self.definitions.source(&config.source_id)?;
                let connector = self.services.registry.source(source, base)?;
                let extraction = Extractor::new(connector, source_query(source, config.query.as_ref()))
                    .extract(ctx)
                    .await?;
                Ok(Produced {
                    attempts: extraction.attempts,
                    failure: extraction.interrupted,
                    ..Produced::records(extraction.records)
                })
            }

            StepKind::Transform(config) => {
                let out = Transformer::new(&config.transforms)?.transform(input, continue_on_error)?;
                Ok(Produced {
                    skipped: out.skipped(),
                    errors: out.failures,
                    ..Produced::records(out.records)
                })
            }

            StepKind::Validate(config) => {
                let out = self.validate_by_source(config, input)?;
                Ok(Produced {
                    rejected: out.rejected,
                    ..Produced::records(out.valid)
                })
            }

            StepKind::Enrich(config) => {
                let out = Enrichment::new(config)?
                    .enrich(input, ctx, continue_on_error)
                    .await?;
                Ok(Produced {
                    skipped: out.failures.len(),
                    attempts: out.attempts,
                    errors: out.failures,
                    ..Produced::records(out.records)
                })
            }

            StepKind::Load(config) => {
                let destination = self.definitions.destination(&config.destination_id)?;
                let connector = self.services.registry.destination(destination, base)?;
                let loader = Loader::new(
                    connector,
                    config.batch_size.unwrap_or(self.services.pipeline.batch_size),
                );
                let out = match loader.load(&input, ctx, continue_on_error).await {
                    Ok(out) => out,
                    Err(e) => {
                        return Ok(Produced {
                            failure: Some(e),
                            ..Produced::records(input)
                        });
                    }
                };
                let mut errors = out.failures;
                if out.failed > 0 {
                    errors.push(
                        FailureDetail::from_error(&Error::Write {
                            target: loader.target().to_string(),
                            message: format!("{} records not written", out.failed),
                        })
                        .at(&step.id),
                    );
                }
                let failure = match (out.aborted, out.cancelled) {
                    (Some(e), _) => Some(e),
                    (None, true) => Some(Error::Cancelled),
                    (None, false) => None,
                };
                Ok(Produced {
                    loaded: out.written,
                    attempts: out.attempts,
                    errors,
                    failure,
                    ..Produced::records(input)
                })
            }

            StepKind::Branch(config) => {
                let next = choose_branch(&step.id, config, context, &input)?;
                tracing::debug!(step = %step.id, next = %next, "branch resolved");
                Ok(Produced {
                    next: Some(next),
                    ..Produced::records(input)
                })
            }
        }
    }
}

/// First route whose condition holds, else the default
///
/// Routes are tried in declared order and evaluation stops at the first
/// match; nested conditions short-circuit the same way.
pub fn choose_branch(
    step_id: &str,
    config: &BranchStepConfig,
    context: &RunContext,
    output: &[Record],
) -> Result<String> {
    let document = context.branch_document(output);
    config
        .branches
        .iter()
        .find(|route| route.condition.evaluate(&document))
        .map(|route| route.next_step_id.clone())
        .or_else(|| config.default_step_id.clone())
        .ok_or_else(|| Error::config(format!("branch step '{step_id}' matched nothing and has no default")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn branch() -> BranchStepConfig {
        serde_yaml::from_str(
            r#"
branches:
  - condition: { field: output.count, operator: GreaterThan, value: 10 }
    nextStepId: bulk
  - condition: { field: output.count, operator: GreaterThan, value: 0 }
    nextStepId: small
  - condition: { field: context.force, operator: Equals, value: true }
    nextStepId: forced
defaultStepId: empty
"#,
        )
        .unwrap()
    }

    fn output(n: usize) -> Vec<Record> {
        (0..n).map(|i| Record::from_value("s", json!({"i": i}))).collect()
    }

    #[test]
    fn test_first_matching_route_wins() {
        let ctx = RunContext::new(Map::new());
        assert_eq!(choose_branch("b", &branch(), &ctx, &output(20)).unwrap(), "bulk");
        assert_eq!(choose_branch("b", &branch(), &ctx, &output(3)).unwrap(), "small");
        assert_eq!(choose_branch("b", &branch(), &ctx, &output(0)).unwrap(), "empty");
    }

    #[test]
    fn test_context_variables_are_visible() {
        let mut ctx = RunContext::new(Map::new());
        ctx.set("force", true);
        assert_eq!(choose_branch("b", &branch(), &ctx, &output(0)).unwrap(), "forced");
    }

    #[test]
    fn test_branch_is_deterministic() {
        let mut ctx = RunContext::new(Map::new());
        ctx.set("force", true);
        let records = output(5);
        let first = choose_branch("b", &branch(), &ctx, &records).unwrap();
        for _ in 0..50 {
            assert_eq!(choose_branch("b", &branch(), &ctx, &records).unwrap(), first);
        }
    }

    #[test]
    fn test_no_match_without_default() {
        let mut config = branch();
        config.default_step_id = None;
        let ctx = RunContext::new(Map::new());
        let err = choose_branch("b", &config, &ctx, &output(0)).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
