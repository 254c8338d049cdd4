//! Enrichment configuration
//!
//! Enrichers add data to records from outside the record itself. They run
//! after validation, so they only see records that will be loaded.
//!
//! ```yaml
//! enrichers:
//!   - type: lookup
//!     keyField: country_code
//!     lookupKey: code
//!     table:
//!       - { code: DE, country: Germany }
//!       - { code: FR, country: France }
//!     fields: [country]
//!
//!   - type: http
//!     url: "https://crm.example.com/customers/{{ customer_id }}"
//!     targetField: customer
//!
//!   - type: metadata
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// What an enricher does when it finds nothing for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMiss {
    /// Pass the record through unchanged
    #[default]
    Keep,
    /// Set the enriched fields to null
    Null,
    /// Treat the miss as an enrichment failure
    Fail,
}

/// Enrichers to apply, in order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentConfig {
    /// Enrichers in declared order
    #[serde(default)]
    pub enrichers: Vec<EnricherConfig>,
}

/// One enricher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EnricherConfig {
    /// Join against a static table
    #[serde(rename_all = "camelCase")]
    Lookup {
        /// Record field holding the join key
        key_field: String,
        /// Table column holding the join key
        lookup_key: String,
        /// Table rows
        table: Vec<Map<String, Value>>,
        /// Columns to copy; every column except the key when empty
        #[serde(default)]
        fields: Vec<String>,
        /// Prefix for copied field names
        #[serde(default)]
        prefix: Option<String>,
        /// Behaviour for keys not in the table
        #[serde(default)]
        on_miss: OnMiss,
    },

    /// Per-record HTTP lookup
    #[serde(rename_all = "camelCase")]
    Http {
        /// URL template rendered against the record
        url: String,
        /// HTTP method
        #[serde(default = "default_method")]
        method: String,
        /// Request headers
        #[serde(default)]
        headers: BTreeMap<String, String>,
        /// Field the response is stored under
        target_field: String,
        /// Dotted path into the response to keep
        #[serde(default)]
        data_path: Option<String>,
        /// Behaviour on 404 responses
        #[serde(default)]
        on_miss: OnMiss,
    },

    /// Stamp run id, source id and timestamps into record metadata
    Metadata {
        /// Extra static metadata entries
        #[serde(default)]
        values: BTreeMap<String, String>,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

impl EnricherConfig {
    /// Short name used in errors and telemetry
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lookup { .. } => "lookup",
            Self::Http { .. } => "http",
            Self::Metadata { .. } => "metadata",
        }
    }
}
