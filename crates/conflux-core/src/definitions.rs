//! Source and destination definitions
//!
//! Definitions are authored and persisted elsewhere; the engine reads them
//! as YAML or JSON documents whose field names and enum values are exactly
//! the symbolic names below.
//!
//! # Example
//!
//! ```yaml
//! id: orders-api
//! name: Orders API
//! type: RestApi
//! connectionProperties:
//!   url: https://api.example.com/orders
//!   dataPath: items
//! ingestMode: FullLoad
//! refreshPolicy: Manual
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::schema::Schema;
use crate::validation::ValidationRule;

/// Connection property naming the concrete provider of a kind
pub const PROVIDER_PROPERTY: &str = "provider";

/// Kind of system a source reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    /// HTTP/JSON endpoint
    RestApi,
    /// Relational database
    Database,
    /// Files
    FileSystem,
    /// Streaming bus
    Streaming,
    /// FTP server
    Ftp,
    /// Caller-registered connector
    Custom,
}

/// Kind of system a destination writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationType {
    /// Relational database
    Database,
    /// Files
    FileSystem,
    /// HTTP/JSON endpoint
    RestApi,
    /// Message queue or streaming bus
    MessageQueue,
    /// Data lake
    DataLake,
    /// Blob storage
    BlobStorage,
    /// Caller-registered connector
    Custom,
}

/// Union of source and destination kinds, used as the registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectorKind {
    /// HTTP/JSON endpoint
    RestApi,
    /// Relational database
    Database,
    /// Files
    FileSystem,
    /// Streaming bus
    Streaming,
    /// Message queue
    MessageQueue,
    /// FTP server
    Ftp,
    /// Data lake
    DataLake,
    /// Blob storage
    BlobStorage,
    /// Caller-registered connector
    Custom,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<SourceType> for ConnectorKind {
    fn from(value: SourceType) -> Self {
        match value {
            SourceType::RestApi => Self::RestApi,
            SourceType::Database => Self::Database,
            SourceType::FileSystem => Self::FileSystem,
            SourceType::Streaming => Self::Streaming,
            SourceType::Ftp => Self::Ftp,
            SourceType::Custom => Self::Custom,
        }
    }
}

impl From<DestinationType> for ConnectorKind {
    fn from(value: DestinationType) -> Self {
        match value {
            DestinationType::Database => Self::Database,
            DestinationType::FileSystem => Self::FileSystem,
            DestinationType::RestApi => Self::RestApi,
            DestinationType::MessageQueue => Self::MessageQueue,
            DestinationType::DataLake => Self::DataLake,
            DestinationType::BlobStorage => Self::BlobStorage,
            DestinationType::Custom => Self::Custom,
        }
    }
}

/// How much of the source a run reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IngestMode {
    /// Everything, every run
    #[default]
    FullLoad,
    /// Only rows past the stored watermark
    Incremental,
    /// Change events
    ChangeDataCapture,
}

/// Who triggers runs; informational for the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefreshPolicy {
    /// On demand
    #[default]
    Manual,
    /// On an external schedule
    Scheduled,
    /// On an external event
    EventDriven,
}

/// A data source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDefinition {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Kind of system
    #[serde(rename = "type")]
    pub source_type: SourceType,
    /// Connector settings (`provider`, `url`, `path`, ...)
    #[serde(default)]
    pub connection_properties: BTreeMap<String, String>,
    /// Resolved schema of extracted records
    #[serde(default)]
    pub schema: Option<Schema>,
    /// Ingest mode
    #[serde(default)]
    pub ingest_mode: IngestMode,
    /// Refresh policy
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
    /// Rules every extracted record must satisfy
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,
    /// Free-form metadata copied into every extracted record
    #[serde(default)]
    pub metadata_properties: BTreeMap<String, String>,
}

/// A data destination
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationDefinition {
    /// Unique id
    pub id: String,
    /// Display name
    pub name: String,
    /// Kind of system
    #[serde(rename = "type")]
    pub destination_type: DestinationType,
    /// Connector settings
    #[serde(default)]
    pub connection_properties: BTreeMap<String, String>,
}

impl SourceDefinition {
    /// Registry kind of this source
    pub fn kind(&self) -> ConnectorKind {
        self.source_type.into()
    }

    /// Declared provider, if any
    pub fn provider(&self) -> Option<&str> {
        self.connection_properties
            .get(PROVIDER_PROPERTY)
            .map(String::as_str)
    }
}

impl DestinationDefinition {
    /// Registry kind of this destination
    pub fn kind(&self) -> ConnectorKind {
        self.destination_type.into()
    }

    /// Declared provider, if any
    pub fn provider(&self) -> Option<&str> {
        self.connection_properties
            .get(PROVIDER_PROPERTY)
            .map(String::as_str)
    }
}

/// Load a YAML or JSON document, choosing the parser by file extension
pub fn load_document<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.display().to_string(),
        });
    }
    let contents = std::fs::read_to_string(path)?;
    if path.extension().is_some_and(|ext| ext == "json") {
        Ok(serde_json::from_str(&contents)?)
    } else {
        Ok(serde_yaml::from_str(&contents)?)
    }
}
