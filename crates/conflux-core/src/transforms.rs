//! Transform DSL configuration
//!
//! Transforms modify records as they flow through a pipeline or a workflow
//! transform step. Configurations are parsed here and executed by the
//! [`interpreter`](crate::interpreter).
//!
//! # Built-in Transforms
//!
//! - `map` - Copy a source field into a target field
//! - `rename` - Move a field to a new name
//! - `drop` - Remove fields from records
//! - `addFields` - Add static fields
//! - `coalesce` - Use first non-null value
//! - `regex` - Pattern matching and capture extraction
//! - `template` - Jinja template rendering
//! - `filter` - Keep only records matching a condition
//! - `cast` - Convert fields to a type
//!
//! # Example
//!
//! ```yaml
//! transforms:
//!   - map:
//!       customer_id: cust_id
//!
//!   - template:
//!       full_name: "{{ first_name }} {{ last_name }}"
//!
//!   - filter:
//!       field: total
//!       operator: GreaterThan
//!       value: 100
//!     onError: skip
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::FilterCondition;
use crate::schema::FieldType;

/// What a failing transform does to the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Drop the failing record, count it, keep going
    Skip,
    /// Abort the run regardless of `continueOnError`
    Abort,
}

/// Behaviour of a regex transform whose pattern does not match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatch {
    /// Set every capture output to null
    #[default]
    Null,
    /// Leave the record unchanged
    Skip,
    /// Fail the record
    Error,
}

/// Regex transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegexConfig {
    /// Source field to match against
    pub field: String,
    /// Regex pattern (with optional named capture groups)
    pub pattern: String,
    /// Capture group mappings: output_field -> group (index or name)
    pub captures: BTreeMap<String, String>,
    /// Behavior when pattern doesn't match
    #[serde(default)]
    pub on_no_match: NoMatch,
}

/// Transform configuration from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformConfig {
    /// Direct field mapping: target <- source field
    Map {
        /// Field mappings
        map: BTreeMap<String, String>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Move fields: old name -> new name
    Rename {
        /// Renames
        rename: BTreeMap<String, String>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Drop specified fields
    Drop {
        /// Fields to drop
        drop: Vec<String>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Add static fields
    AddFields {
        /// Fields to add
        #[serde(rename = "addFields")]
        add_fields: BTreeMap<String, serde_json::Value>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Coalesce: use first non-null value from list
    Coalesce {
        /// Coalesce mappings
        coalesce: BTreeMap<String, Vec<String>>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Regex pattern matching and capture extraction
    Regex {
        /// Regex configuration
        regex: RegexConfig,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Jinja template rendering
    Template {
        /// Template mappings
        template: BTreeMap<String, String>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Keep records matching a condition
    Filter {
        /// Condition records must satisfy
        filter: FilterCondition,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },

    /// Convert field values
    Cast {
        /// Field -> target type
        cast: BTreeMap<String, FieldType>,
        /// Transform-level error handling override
        #[serde(default, rename = "onError", skip_serializing_if = "Option::is_none")]
        on_error: Option<OnError>,
    },
}

impl TransformConfig {
    /// Short name used in errors and telemetry
    pub fn name(&self) -> &'static str {
        match self {
            Self::Map { .. } => "map",
            Self::Rename { .. } => "rename",
            Self::Drop { .. } => "drop",
            Self::AddFields { .. } => "addFields",
            Self::Coalesce { .. } => "coalesce",
            Self::Regex { .. } => "regex",
            Self::Template { .. } => "template",
            Self::Filter { .. } => "filter",
            Self::Cast { .. } => "cast",
        }
    }

    /// Get the optional transform-level error handling override
    pub fn on_error(&self) -> Option<OnError> {
        match self {
            Self::Map { on_error, .. }
            | Self::Rename { on_error, .. }
            | Self::Drop { on_error, .. }
            | Self::AddFields { on_error, .. }
            | Self::Coalesce { on_error, .. }
            | Self::Regex { on_error, .. }
            | Self::Template { on_error, .. }
            | Self::Filter { on_error, .. }
            | Self::Cast { on_error, .. } => *on_error,
        }
    }
}
