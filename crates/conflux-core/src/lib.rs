//! Conflux Core Library
//!
//! This crate provides the building blocks the Conflux runtime executes:
//! - Record model and schemas
//! - Source, destination and workflow documents
//! - Connector traits, built-in connectors and the provider registry
//! - Transform, validation and enrichment configuration
//! - Project configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Definitions │────▶│  Registry   │────▶│  Connector  │
//! │   (YAML)    │     │ kind/provider│    │ read/write  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use conflux_core::{ConnectorRegistry, SourceDefinition, definitions::load_document};
//!
//! let source: SourceDefinition = load_document("sources/orders.yaml")?;
//! let connector = ConnectorRegistry::with_defaults().source(&source, None)?;
//! println!("Target: {}", connector.target());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod condition;
pub mod config;
pub mod connectors;
pub mod definitions;
pub mod enrichment;
pub mod error;
pub mod interpreter;
pub mod record;
pub mod registry;
pub mod schema;
pub mod transforms;
pub mod validation;
pub mod workflow;

pub use config::{Config, ProjectConfig, ResilienceSettings};
pub use connectors::{Connection, Connector, ConnectorSpec, ReadQuery, WriteCounts};
pub use definitions::{ConnectorKind, DestinationDefinition, SourceDefinition};
pub use error::{Error, ErrorKind, Result};
pub use record::Record;
pub use registry::ConnectorRegistry;
pub use schema::{Schema, SchemaCatalog};
pub use workflow::{StepType, Workflow, WorkflowStep};
