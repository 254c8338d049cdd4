//! In-memory connector (`Custom` / `memory`)
//!
//! Named datasets held in a [`MemoryStore`] shared by every connector the
//! registry builds. Useful for demos, tests, and handing records between
//! runs in one process. Every read extracts fresh records: new ids at
//! version 1, attributed to the reading definition.
//!
//! ```yaml
//! type: Custom
//! connectionProperties:
//!   provider: memory
//!   dataset: staged-orders    # defaults to the definition id
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Connection, Connector, ConnectorSpec, ReadQuery, RecordStream, WriteCounts};
use crate::definitions::ConnectorKind;
use crate::error::Result;
use crate::record::Record;

/// Provider name
pub const PROVIDER: &str = "memory";

/// Shared named datasets
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    datasets: Arc<Mutex<HashMap<String, Vec<Record>>>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Record>>> {
        self.datasets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace a dataset
    pub fn insert(&self, dataset: impl Into<String>, records: Vec<Record>) {
        self.lock().insert(dataset.into(), records);
    }

    /// Append to a dataset
    pub fn extend(&self, dataset: &str, records: &[Record]) {
        self.lock()
            .entry(dataset.to_string())
            .or_default()
            .extend_from_slice(records);
    }

    /// Copy of a dataset; empty when absent
    pub fn records(&self, dataset: &str) -> Vec<Record> {
        self.lock().get(dataset).cloned().unwrap_or_default()
    }

    /// Number of records in a dataset
    pub fn len(&self, dataset: &str) -> usize {
        self.lock().get(dataset).map_or(0, Vec::len)
    }

    /// Whether a dataset is empty or absent
    pub fn is_empty(&self, dataset: &str) -> bool {
        self.len(dataset) == 0
    }
}

/// Reads and writes one dataset of a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryConnector {
    kind: ConnectorKind,
    source_id: String,
    dataset: String,
    target: String,
    store: MemoryStore,
}

impl MemoryConnector {
    /// Build from a spec against `store`
    pub fn new(spec: ConnectorSpec, store: MemoryStore) -> Result<Self> {
        let dataset = spec.property("dataset").unwrap_or(&spec.id).to_string();
        let target = spec.target(PROVIDER, &dataset);
        Ok(Self {
            kind: spec.kind,
            source_id: spec.id.clone(),
            dataset,
            target,
            store,
        })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MemoryConnection {
            source_id: self.source_id.clone(),
            dataset: self.dataset.clone(),
            store: self.store.clone(),
        }))
    }
}

struct MemoryConnection {
    source_id: String,
    dataset: String,
    store: MemoryStore,
}

impl MemoryConnection {
    fn extracted(&self, stored: Record) -> Record {
        let mut record = Record::new(&self.source_id, stored.data);
        record.schema_id = stored.schema_id;
        record.metadata = stored.metadata;
        record
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn read<'a>(&'a self, query: Option<&'a ReadQuery>) -> RecordStream<'a> {
        let mut records = self.store.records(&self.dataset);
        if let Some(limit) = query.and_then(|q| q.limit) {
            records.truncate(limit);
        }
        stream::iter(records.into_iter().map(move |stored| Ok(self.extracted(stored)))).boxed()
    }

    async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
        self.store.extend(&self.dataset, records);
        Ok(WriteCounts {
            written: records.len(),
            failed: 0,
        })
    }
}
