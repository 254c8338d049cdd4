//! Run requests
//!
//! A request is everything one run needs besides the engine itself. Request
//! files are YAML or JSON; each definition in them may be inline or a path
//! to its own document, relative to the request file:
//!
//! ```yaml
//! source: sources/orders.yaml
//! destination:
//!   id: archive
//!   name: Archive
//!   type: FileSystem
//!   connectionProperties:
//!     path: out/orders.jsonl
//! config:
//!   transforms:
//!     - drop: [internal_notes]
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use conflux_core::definitions::load_document;
use conflux_core::{Config, DestinationDefinition, Error, Result, SourceDefinition, Workflow};

use crate::pipeline::PipelineConfig;

/// Project directory holding source definitions
pub const SOURCES_DIR: &str = "sources";

/// Project directory holding destination definitions
pub const DESTINATIONS_DIR: &str = "destinations";

/// Project directory holding workflow documents
pub const WORKFLOWS_DIR: &str = "workflows";

/// Sources and destinations a run may refer to by id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definitions {
    /// Source definitions
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
    /// Destination definitions
    #[serde(default)]
    pub destinations: Vec<DestinationDefinition>,
}

impl Definitions {
    /// Definitions from lists
    pub fn new(sources: Vec<SourceDefinition>, destinations: Vec<DestinationDefinition>) -> Self {
        Self {
            sources,
            destinations,
        }
    }

    /// Every definition under the project's `sources/` and `destinations/`
    pub fn from_project(config: &Config) -> Result<Self> {
        let sources = config
            .documents(SOURCES_DIR)?
            .iter()
            .map(load_document)
            .collect::<Result<Vec<SourceDefinition>>>()?;
        let destinations = config
            .documents(DESTINATIONS_DIR)?
            .iter()
            .map(load_document)
            .collect::<Result<Vec<DestinationDefinition>>>()?;
        Ok(Self::new(sources, destinations))
    }

    /// Source by id
    pub fn source(&self, id: &str) -> Result<&SourceDefinition> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::config(format!("unknown source '{id}'")))
    }

    /// Destination by id
    pub fn destination(&self, id: &str) -> Result<&DestinationDefinition> {
        self.destinations
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::config(format!("unknown destination '{id}'")))
    }

    /// Add `other`'s definitions after these; ids already present win
    pub fn merge(&mut self, other: Definitions) {
        for source in other.sources {
            if self.source(&source.id).is_err() {
                self.sources.push(source);
            }
        }
        for destination in other.destinations {
            if self.destination(&destination.id).is_err() {
                self.destinations.push(destination);
            }
        }
    }
}

/// One pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    /// Where records come from
    pub source: SourceDefinition,
    /// Where records go
    pub destination: DestinationDefinition,
    /// Stages in between
    #[serde(default)]
    pub config: PipelineConfig,
}

/// One workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    /// Workflow document
    pub workflow: Workflow,
    /// Sources and destinations the steps refer to
    #[serde(flatten)]
    pub definitions: Definitions,
    /// Initial context; overrides project and workflow variables
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Inline document or a path to one
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DocumentRef<T> {
    Path(PathBuf),
    Inline(T),
}

impl<T: DeserializeOwned> DocumentRef<T> {
    fn resolve(self, base: &Path) -> Result<T> {
        match self {
            Self::Inline(doc) => Ok(doc),
            Self::Path(path) if path.is_relative() => load_document(base.join(path)),
            Self::Path(path) => load_document(path),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PipelineRequestFile {
    source: DocumentRef<SourceDefinition>,
    destination: DocumentRef<DestinationDefinition>,
    #[serde(default)]
    config: Option<DocumentRef<PipelineConfig>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowRequestFile {
    workflow: DocumentRef<Workflow>,
    #[serde(default)]
    sources: Vec<DocumentRef<SourceDefinition>>,
    #[serde(default)]
    destinations: Vec<DocumentRef<DestinationDefinition>>,
    #[serde(default)]
    context: Map<String, Value>,
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new("."))
}

/// Load a pipeline request file
pub fn load_pipeline_request(path: impl AsRef<Path>) -> Result<PipelineRequest> {
    let path = path.as_ref();
    let file: PipelineRequestFile = load_document(path)?;
    let base = parent_of(path);
    Ok(PipelineRequest {
        source: file.source.resolve(base)?,
        destination: file.destination.resolve(base)?,
        config: file
            .config
            .map(|c| c.resolve(base))
            .transpose()?
            .unwrap_or_default(),
    })
}

/// Load a workflow request file, or a bare workflow document
///
/// A bare workflow gets no definitions of its own; callers usually
/// [`Definitions::merge`] the project's in.
pub fn load_workflow_request(path: impl AsRef<Path>) -> Result<WorkflowRequest> {
    let path = path.as_ref();
    let document: Value = load_document(path)?;
    if document.get("workflow").is_none() {
        return Ok(WorkflowRequest {
            workflow: serde_json::from_value(document)?,
            definitions: Definitions::default(),
            context: Map::new(),
        });
    }
    let file: WorkflowRequestFile = serde_json::from_value(document)?;
    let base = parent_of(path);
    Ok(WorkflowRequest {
        workflow: file.workflow.resolve(base)?,
        definitions: Definitions::new(
            file.sources
                .into_iter()
                .map(|s| s.resolve(base))
                .collect::<Result<_>>()?,
            file.destinations
                .into_iter()
                .map(|d| d.resolve(base))
                .collect::<Result<_>>()?,
        ),
        context: file.context,
    })
}
