//! Workflow documents
//!
//! A workflow is a graph of typed steps. Each step names the step to run
//! after it succeeds (`onSuccess`) and after it fails (`onFailure`); a step
//! without `onSuccess` completes the workflow. Branch steps choose their
//! successor from an ordered list of conditions.
//!
//! # Example
//!
//! ```yaml
//! id: orders
//! name: Nightly orders
//! startStepId: extract
//! variables:
//!   region: EU
//! steps:
//!   - id: extract
//!     type: Extract
//!     config:
//!       sourceId: orders-api
//!     onSuccess: route
//!
//!   - id: route
//!     type: Branch
//!     config:
//!       branches:
//!         - condition: { field: output.count, operator: GreaterThan, value: 0 }
//!           nextStepId: load
//!       defaultStepId: done
//!
//!   - id: load
//!     type: Load
//!     config:
//!       destinationId: warehouse
//!     onFailure: terminate
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::FilterCondition;
use crate::connectors::ReadQuery;
use crate::enrichment::EnrichmentConfig;
use crate::transforms::TransformConfig;
use crate::validation::ValidationConfig;

/// `onFailure` value that ends the workflow as failed
pub const TERMINATE: &str = "terminate";

/// A workflow document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique id
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// First step to execute
    pub start_step_id: String,

    /// Steps in declared order
    pub steps: Vec<WorkflowStep>,

    /// Initial context variables; the run's initial context overrides them
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,

    /// Override of the engine's step execution budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_step_executions: Option<usize>,
}

impl Workflow {
    /// Step by id
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Where a failed step goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailureTarget {
    /// End the workflow as failed
    Terminate,
    /// Continue at another step
    Step(String),
}

impl From<String> for FailureTarget {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case(TERMINATE) {
            Self::Terminate
        } else {
            Self::Step(value)
        }
    }
}

impl From<FailureTarget> for String {
    fn from(value: FailureTarget) -> Self {
        match value {
            FailureTarget::Terminate => TERMINATE.to_string(),
            FailureTarget::Step(id) => id,
        }
    }
}

/// One node of the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique id within the workflow
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Step type and its configuration
    #[serde(flatten)]
    pub kind: StepKind,

    /// Next step on success; none completes the workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,

    /// Next step on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailureTarget>,

    /// On failure without `onFailure`, continue at `onSuccess` with no records
    #[serde(default)]
    pub continue_on_error: bool,

    /// Upper bound on executions of this step within one run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    /// Named dataset to use as input instead of the previous step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Store this step's output as a named dataset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_binding: Option<String>,
}

impl WorkflowStep {
    /// Step ids this step can transition to
    pub fn successors(&self) -> Vec<&str> {
        let mut next = Vec::new();
        match &self.kind {
            StepKind::Branch(branch) => {
                next.extend(branch.branches.iter().map(|b| b.next_step_id.as_str()));
                next.extend(branch.default_step_id.as_deref());
            }
            _ => next.extend(self.on_success.as_deref()),
        }
        if let Some(FailureTarget::Step(id)) = &self.on_failure {
            next.push(id);
        }
        next
    }
}

/// Step type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    /// Read from a source
    Extract,
    /// Apply transforms
    Transform,
    /// Check records
    Validate,
    /// Add data from lookups
    Enrich,
    /// Write to a destination
    Load,
    /// Choose the next step
    Branch,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Step type plus configuration payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "config")]
pub enum StepKind {
    /// Read records from a source
    Extract(ExtractStepConfig),
    /// Apply transforms
    Transform(TransformStepConfig),
    /// Validate records; rejected records leave the stream
    Validate(ValidationConfig),
    /// Enrich records
    Enrich(EnrichmentConfig),
    /// Write records to a destination
    Load(LoadStepConfig),
    /// Route to the next step
    Branch(BranchStepConfig),
}

impl StepKind {
    /// The step type
    pub fn step_type(&self) -> StepType {
        match self {
            Self::Extract(_) => StepType::Extract,
            Self::Transform(_) => StepType::Transform,
            Self::Validate(_) => StepType::Validate,
            Self::Enrich(_) => StepType::Enrich,
            Self::Load(_) => StepType::Load,
            Self::Branch(_) => StepType::Branch,
        }
    }
}

/// Extract step configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractStepConfig {
    /// Source definition id
    pub source_id: String,
    /// Read parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<ReadQuery>,
}

/// Transform step configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformStepConfig {
    /// Transforms in order
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
}

/// Load step configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadStepConfig {
    /// Destination definition id
    pub destination_id: String,
    /// Records per write call; the engine default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// One conditional route of a branch step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRoute {
    /// Predicate over the branch context
    pub condition: FilterCondition,
    /// Step taken when the predicate holds
    pub next_step_id: String,
}

/// Branch step configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchStepConfig {
    /// Routes, evaluated in declared order
    #[serde(default)]
    pub branches: Vec<BranchRoute>,
    /// Step taken when no route matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_id: Option<String>,
}
