//! Conflux Runtime
//!
//! This crate executes what `conflux-core` describes: single-pass
//! pipelines and multi-step workflows.
//!
//! # Features
//!
//! - Resilience layer (retry, circuit breaker, timeout) around every outbound call
//! - Extract, transform, validate, enrich and load stages
//! - Pipeline processor and workflow engine with branching and cycle checks
//! - Telemetry side-channel with pluggable sinks
//! - Cooperative cancellation
//!
//! # Usage
//!
//! ```rust,ignore
//! use conflux_runtime::{Engine, load_workflow_request};
//! use tokio_util::sync::CancellationToken;
//!
//! let engine = Engine::new(&config);
//! let request = load_workflow_request("workflows/nightly.yaml")?;
//! let result = engine.run_workflow(&request, &CancellationToken::new()).await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod error;
pub mod pipeline;
pub mod requests;
pub mod resilience;
pub mod result;
pub mod stages;
pub mod telemetry;
pub mod workflow;

pub use engine::{Engine, EngineBuilder, Services};
pub use error::{Error, ErrorKind, FailureDetail, Result};
pub use pipeline::{PipelineConfig, PipelineProcessor};
pub use requests::{
    Definitions, PipelineRequest, WorkflowRequest, load_pipeline_request, load_workflow_request,
};
pub use resilience::{Attempted, CircuitBreakerRegistry, CircuitState, Resilience, ResiliencePolicy};
pub use result::{
    PipelineRunResult, RunStatus, Stage, StageResult, WorkflowRunResult, WorkflowStepResult,
};
pub use telemetry::{
    CollectingSink, EventKind, EventScope, NoopSink, SharedSink, TelemetryEvent, TelemetrySink,
    TracingSink,
};
pub use workflow::WorkflowEngine;
