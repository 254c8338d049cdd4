//! Run context of one workflow run
//!
//! Holds the context variables, datasets bound by `outputBinding`, what the
//! previous step did, and how often each step has run.

use serde_json::{Map, Value, json};
use std::collections::HashMap;

use conflux_core::Record;

#[derive(Debug, Clone)]
struct PreviousStep {
    step_id: String,
    success: bool,
    error_count: usize,
}

/// Mutable state threaded through the steps of a run
#[derive(Debug, Default)]
pub struct RunContext {
    variables: Map<String, Value>,
    datasets: HashMap<String, Vec<Record>>,
    previous: Option<PreviousStep>,
    executions: HashMap<String, u32>,
    total_executions: usize,
}

impl RunContext {
    /// Context starting from `variables`
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    /// Current variables
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Give up the variables at the end of a run
    pub fn into_variables(self) -> Map<String, Value> {
        self.variables
    }

    /// Set a variable
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Store `records` as the dataset `name` and set `<name>Count`
    pub fn bind(&mut self, name: &str, records: &[Record]) {
        self.set(format!("{name}Count"), records.len());
        self.datasets.insert(name.to_string(), records.to_vec());
    }

    /// A bound dataset
    pub fn dataset(&self, name: &str) -> Option<&[Record]> {
        self.datasets.get(name).map(Vec::as_slice)
    }

    /// Remember the outcome of the step that just ran
    pub fn finish_step(&mut self, step_id: &str, success: bool, error_count: usize) {
        self.previous = Some(PreviousStep {
            step_id: step_id.to_string(),
            success,
            error_count,
        });
    }

    /// Count one more execution of `step_id`
    ///
    /// Returns that step's execution count and the run's total, both
    /// including this one.
    pub fn count_execution(&mut self, step_id: &str) -> (u32, usize) {
        let count = self.executions.entry(step_id.to_string()).or_default();
        *count += 1;
        self.total_executions += 1;
        (*count, self.total_executions)
    }

    /// Document branch conditions are evaluated against
    ///
    /// ```json
    /// {
    ///   "context": { "region": "EU", "rawCount": 12 },
    ///   "output": { "count": 12, "records": [...], "first": {...} },
    ///   "previous": { "stepId": "extract", "success": true, "errorCount": 0 }
    /// }
    /// ```
    pub fn branch_document(&self, output: &[Record]) -> Value {
        let records: Vec<Value> = output.iter().map(|r| Value::Object(r.data.clone())).collect();
        let first = records.first().cloned().unwrap_or(Value::Null);
        let previous = match &self.previous {
            Some(p) => json!({
                "stepId": p.step_id,
                "success": p.success,
                "errorCount": p.error_count,
            }),
            None => Value::Null,
        };
        json!({
            "context": self.variables,
            "output": {
                "count": output.len(),
                "records": records,
                "first": first,
            },
            "previous": previous,
        })
    }
}
