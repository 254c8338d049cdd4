//! The record model
//!
//! A [`Record`] is the unit of data that flows through every stage. Stages
//! never edit a record they were handed; they produce a new version with
//! [`Record::revise`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Canonical in-memory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique within one run
    pub id: String,

    /// Schema the record claims to conform to
    #[serde(default)]
    pub schema_id: Option<String>,

    /// Source definition the record was extracted from
    pub source_id: String,

    /// Field values, in insertion order
    pub data: Map<String, Value>,

    /// Free-form string metadata (offsets, file names, run ids)
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// When the record was first extracted
    pub created_at: DateTime<Utc>,

    /// When the current version was produced
    pub updated_at: DateTime<Utc>,

    /// Starts at 1, bumped by every revision
    pub version: u32,
}

impl Record {
    /// Create a fresh record with a generated id
    pub fn new(source_id: impl Into<String>, data: Map<String, Value>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), source_id, data)
    }

    /// Create a fresh record with a caller-chosen id
    pub fn with_id(
        id: impl Into<String>,
        source_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            schema_id: None,
            source_id: source_id.into(),
            data,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Build a record from a JSON value; non-object values land under `value`
    pub fn from_value(source_id: impl Into<String>, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(source_id, data)
    }

    /// Attach a schema id
    pub fn with_schema(mut self, schema_id: impl Into<String>) -> Self {
        self.schema_id = Some(schema_id.into());
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Produce the next version of this record carrying `data`
    pub fn revise(&self, data: Map<String, Value>) -> Self {
        Self {
            id: self.id.clone(),
            schema_id: self.schema_id.clone(),
            source_id: self.source_id.clone(),
            data,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            version: self.version + 1,
        }
    }

    /// Field value by name
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// The data as a JSON object value
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}
