//! Workflow execution
//!
//! - [`graph`] rejects malformed graphs before anything runs
//! - [`steps`] executes one step by delegating to its stage
//! - [`engine`] moves between steps and finalizes the run
//! - [`context`] carries variables and bound datasets between steps

pub mod context;
pub mod engine;
pub mod graph;
pub mod steps;

pub use context::RunContext;
pub use engine::WorkflowEngine;
pub use steps::{StepOutcome, StepProcessor, choose_branch};
