//! Validate stage

use conflux_core::validation::{RuleSet, ValidationConfig, ValidationRule, validate_record};
use conflux_core::{Error, Record, Result, SchemaCatalog};

use crate::result::{MAX_REPORTED_REJECTIONS, Rejection};

/// Records after validation
#[derive(Debug, Default)]
pub struct ValidationOutput {
    /// Records that passed
    pub valid: Vec<Record>,
    /// Number of rejected records
    pub rejected: usize,
    /// First rejections with their reasons
    pub rejections: Vec<Rejection>,
}

/// Checks records against their schema and a rule set
pub struct Validator {
    rules: RuleSet,
    fallback_schema: Option<String>,
    abort_on_first_failure: bool,
}

impl ValidationOutput {
    /// Fold another output into this one
    pub fn absorb(&mut self, other: ValidationOutput) {
        self.valid.extend(other.valid);
        self.rejected += other.rejected;
        let room = MAX_REPORTED_REJECTIONS.saturating_sub(self.rejections.len());
        self.rejections.extend(other.rejections.into_iter().take(room));
    }
}

impl Validator {
    /// Build from a validation config plus rules declared elsewhere (the source)
    pub fn new(config: &ValidationConfig, extra_rules: &[ValidationRule]) -> Result<Self> {
        Ok(Self {
            rules: RuleSet::compile(config.rules.iter().chain(extra_rules))?,
            fallback_schema: config.schema_id.clone(),
            abort_on_first_failure: config.abort_on_first_failure,
        })
    }

    /// Split records into valid ones and counted rejections
    ///
    /// With `abort_on_first_failure` the first invalid record fails the
    /// stage with [`Error::Validation`]. A record naming an unknown schema
    /// always fails it with a configuration error.
    pub fn validate(&self, records: Vec<Record>, catalog: &SchemaCatalog) -> Result<ValidationOutput> {
        let mut output = ValidationOutput {
            valid: Vec::with_capacity(records.len()),
            ..Default::default()
        };
        for record in records {
            let reasons =
                validate_record(&record, &self.rules, catalog, self.fallback_schema.as_deref())?;
            if reasons.is_empty() {
                output.valid.push(record);
                continue;
            }
            if self.abort_on_first_failure {
                return Err(Error::Validation {
                    record_id: record.id,
                    message: reasons.join("; "),
                });
            }
            tracing::debug!(record = %record.id, reasons = ?reasons, "record rejected");
            output.rejected += 1;
            if output.rejections.len() < MAX_REPORTED_REJECTIONS {
                output.rejections.push(Rejection {
                    record_id: record.id,
                    reasons,
                });
            }
        }
        Ok(output)
    }
}
