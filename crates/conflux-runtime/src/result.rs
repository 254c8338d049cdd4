//! Run results
//!
//! Results are opened when a run starts and finalized exactly once, when the
//! run reaches a terminal status. [`PipelineRunTracker::finish`] and
//! [`WorkflowRunTracker::finish`] consume the tracker, so there is no way to
//! finalize twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FailureDetail;
use conflux_core::workflow::StepType;

/// Rejections listed per validate stage; the count is always exact
pub const MAX_REPORTED_REJECTIONS: usize = 100;

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    /// Completed without failures
    Succeeded,
    /// Completed, but some failures were recovered or the source broke off
    PartiallyFailed,
    /// Ended by a fatal failure
    Failed,
    /// Ended by a cancellation request
    Cancelled,
}

impl RunStatus {
    /// Whether the run delivered anything useful
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Read from the source
    Extract,
    /// Apply transforms
    Transform,
    /// Check records
    Validate,
    /// Add data
    Enrich,
    /// Write to the destination
    Load,
}

impl Stage {
    /// Lowercase name used in logs and failure details
    pub fn name(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Validate => "validate",
            Self::Enrich => "enrich",
            Self::Load => "load",
        }
    }
}

/// A record excluded by validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Rejected record
    pub record_id: String,
    /// Every violation found
    pub reasons: Vec<String>,
}

/// Outcome of one pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    /// Which stage
    pub stage: Stage,
    /// Whether the stage completed
    pub success: bool,
    /// Records handed to the stage
    pub records_in: usize,
    /// Records the stage produced
    pub records_out: usize,
    /// Records excluded by validation
    pub rejected: usize,
    /// Records dropped by filters or recovered failures
    pub skipped: usize,
    /// Outbound attempts made through the resilience layer
    pub attempts: u32,
    /// Failures, recovered or fatal
    pub errors: Vec<FailureDetail>,
    /// First rejections, capped at [`MAX_REPORTED_REJECTIONS`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejections: Vec<Rejection>,
    /// Wall time
    pub duration_ms: u64,
}

impl StageResult {
    /// Empty result for a stage that saw `records_in` records
    pub fn new(stage: Stage, records_in: usize) -> Self {
        Self {
            stage,
            success: true,
            records_in,
            records_out: 0,
            rejected: 0,
            skipped: 0,
            attempts: 0,
            errors: Vec::new(),
            rejections: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Result of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunResult {
    /// Run id
    pub run_id: String,
    /// Pipeline id (`<source>-><destination>` unless named)
    pub pipeline_id: String,
    /// Terminal status
    pub status: RunStatus,
    /// Records extracted
    pub records_in: usize,
    /// Records written to the destination
    pub records_out: usize,
    /// Records excluded by validation
    pub rejected: usize,
    /// Records dropped by filters or recovered failures
    pub skipped: usize,
    /// Per-stage results in execution order
    pub stages: Vec<StageResult>,
    /// Run-level failures; the first fatal one decides a `Failed` status
    pub errors: Vec<FailureDetail>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Wall time
    pub duration_ms: u64,
}

impl PipelineRunResult {
    /// Result of a stage, if it ran
    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Accumulates a pipeline run's result
#[derive(Debug)]
pub struct PipelineRunTracker {
    run_id: String,
    pipeline_id: String,
    started_at: DateTime<Utc>,
    clock: tokio::time::Instant,
    stages: Vec<StageResult>,
    errors: Vec<FailureDetail>,
    records_in: usize,
    records_out: usize,
}

impl PipelineRunTracker {
    /// Open a result at run start
    pub fn start(run_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_id: pipeline_id.into(),
            started_at: Utc::now(),
            clock: tokio::time::Instant::now(),
            stages: Vec::new(),
            errors: Vec::new(),
            records_in: 0,
            records_out: 0,
        }
    }

    /// Run id
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Add a finished stage
    pub fn push_stage(&mut self, stage: StageResult) {
        match stage.stage {
            Stage::Extract => self.records_in = stage.records_out,
            Stage::Load => self.records_out = stage.records_out,
            _ => {}
        }
        self.stages.push(stage);
    }

    /// Add a run-level failure
    pub fn push_error(&mut self, error: FailureDetail) {
        self.errors.push(error);
    }

    /// Finalize with a terminal status
    pub fn finish(self, status: RunStatus) -> PipelineRunResult {
        let rejected = self.stages.iter().map(|s| s.rejected).sum();
        let skipped = self.stages.iter().map(|s| s.skipped).sum();
        PipelineRunResult {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id,
            status,
            records_in: self.records_in,
            records_out: self.records_out,
            rejected,
            skipped,
            stages: self.stages,
            errors: self.errors,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(self.clock),
        }
    }
}

/// Result of one workflow step execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepResult {
    /// Step id
    pub step_id: String,
    /// Step type
    pub step_type: StepType,
    /// Whether the step succeeded
    pub success: bool,
    /// Records the step handed on
    pub output_records: usize,
    /// Records excluded by a validate step
    #[serde(default)]
    pub rejected: usize,
    /// Records skipped by filters or recovered failures
    #[serde(default)]
    pub skipped: usize,
    /// Outbound attempts made
    #[serde(default)]
    pub attempts: u32,
    /// Failures
    pub errors: Vec<FailureDetail>,
    /// Step chosen next, when any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step_id: Option<String>,
    /// Wall time
    pub duration_ms: u64,
}

impl WorkflowStepResult {
    /// Successful result with no output yet
    pub fn new(step_id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            step_id: step_id.into(),
            step_type,
            success: true,
            output_records: 0,
            rejected: 0,
            skipped: 0,
            attempts: 0,
            errors: Vec::new(),
            next_step_id: None,
            duration_ms: 0,
        }
    }
}

/// Result of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunResult {
    /// Run id
    pub run_id: String,
    /// Workflow id
    pub workflow_id: String,
    /// Terminal status
    pub status: RunStatus,
    /// Records extracted by all extract steps
    pub records_in: usize,
    /// Records written by all load steps
    pub records_out: usize,
    /// Records rejected by all validate steps
    pub rejected: usize,
    /// Step executions in order
    pub steps: Vec<WorkflowStepResult>,
    /// Run-level failures
    pub errors: Vec<FailureDetail>,
    /// Context variables at the end of the run
    pub context: Map<String, Value>,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub finished_at: DateTime<Utc>,
    /// Wall time
    pub duration_ms: u64,
}

impl WorkflowRunResult {
    /// Ids of executed steps, in order
    pub fn path(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_id.as_str()).collect()
    }
}

/// Accumulates a workflow run's result
#[derive(Debug)]
pub struct WorkflowRunTracker {
    run_id: String,
    workflow_id: String,
    started_at: DateTime<Utc>,
    clock: tokio::time::Instant,
    steps: Vec<WorkflowStepResult>,
    errors: Vec<FailureDetail>,
    records_in: usize,
    records_out: usize,
}

impl WorkflowRunTracker {
    /// Open a result at run start
    pub fn start(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            clock: tokio::time::Instant::now(),
            steps: Vec::new(),
            errors: Vec::new(),
            records_in: 0,
            records_out: 0,
        }
    }

    /// Add a step execution; `loaded` is what a load step wrote
    pub fn push_step(&mut self, step: WorkflowStepResult, loaded: usize) {
        match step.step_type {
            StepType::Extract => self.records_in += step.output_records,
            StepType::Load => self.records_out += loaded,
            _ => {}
        }
        self.steps.push(step);
    }

    /// Add a run-level failure
    pub fn push_error(&mut self, error: FailureDetail) {
        self.errors.push(error);
    }

    /// Whether any executed step failed
    pub fn any_step_failed(&self) -> bool {
        self.steps.iter().any(|s| !s.success)
    }

    /// Finalize with a terminal status
    pub fn finish(self, status: RunStatus, context: Map<String, Value>) -> WorkflowRunResult {
        let rejected = self.steps.iter().map(|s| s.rejected).sum();
        WorkflowRunResult {
            run_id: self.run_id,
            workflow_id: self.workflow_id,
            status,
            records_in: self.records_in,
            records_out: self.records_out,
            rejected,
            steps: self.steps,
            errors: self.errors,
            context,
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed_ms(self.clock),
        }
    }
}

pub(crate) fn elapsed_ms(since: tokio::time::Instant) -> u64 {
    since.elapsed().as_millis().min(u64::MAX as u128) as u64
}
