//! Extract stage

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use conflux_core::connectors::{ReadQuery, Watermark};
use conflux_core::definitions::IngestMode;
use conflux_core::{Connection, Connector, Error, Record, Result, SourceDefinition};

use super::{StageContext, release};
use crate::resilience::timeout;

/// Connection property naming the incremental column
pub const INCREMENTAL_COLUMN_PROPERTY: &str = "incrementalColumn";

/// Connection property holding the last ingested value
pub const WATERMARK_PROPERTY: &str = "watermark";

/// Records read from a source
#[derive(Debug)]
pub struct Extraction {
    /// Records read before the stream ended or broke off
    pub records: Vec<Record>,
    /// Error that broke the stream after it had produced records
    pub interrupted: Option<Error>,
    /// Outbound attempts, connect included
    pub attempts: u32,
}

/// Reads a source through its connector
pub struct Extractor {
    connector: Arc<dyn Connector>,
    query: Option<ReadQuery>,
}

impl Extractor {
    /// Extractor over `connector` with optional read parameters
    pub fn new(connector: Arc<dyn Connector>, query: Option<ReadQuery>) -> Self {
        Self { connector, query }
    }

    /// Connect, read everything, release the connection
    ///
    /// A read that fails before producing anything is a failed attempt and
    /// is retried. A read that fails part way is not: the records read so
    /// far are returned with the error in [`Extraction::interrupted`]. The
    /// target's timeout bounds the wait for each record, not the whole read,
    /// so a stall after some records is an interruption too.
    pub async fn extract(&self, ctx: &StageContext) -> Result<Extraction> {
        let target = self.connector.target();
        let connected = ctx
            .resilience
            .execute(&ctx.scope, target, || self.connector.connect())
            .await?;
        let connection = connected.value;

        let stall = ctx.resilience.policy_for(target).timeout;
        let read = ctx
            .resilience
            .execute_paced(&ctx.scope, target, || {
                read_all(connection.as_ref(), self.query.as_ref(), target, stall)
            })
            .await;
        release(connection, target).await;

        let read = read?;
        let (records, interrupted) = read.value;
        if let Some(e) = &interrupted {
            tracing::warn!(
                endpoint = target,
                records = records.len(),
                error = %e,
                "source stream broke off"
            );
        }
        Ok(Extraction {
            records,
            interrupted,
            attempts: connected.attempts + read.attempts,
        })
    }
}

async fn read_all(
    connection: &dyn Connection,
    query: Option<&ReadQuery>,
    target: &str,
    stall: Duration,
) -> Result<(Vec<Record>, Option<Error>)> {
    let limit = query.and_then(|q| q.limit);
    let mut stream = connection.read(query);
    let mut records = Vec::new();
    loop {
        let item = match timeout::bounded(target, stall, async { Ok(stream.next().await) }).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => Err(e),
        };
        match item {
            Ok(record) => {
                records.push(record);
                if limit.is_some_and(|l| records.len() >= l) {
                    break;
                }
            }
            Err(e) if records.is_empty() => return Err(e),
            Err(e) => return Ok((records, Some(e))),
        }
    }
    Ok((records, None))
}

/// Read parameters for a source, adding its stored watermark in incremental mode
pub fn source_query(source: &SourceDefinition, query: Option<&ReadQuery>) -> Option<ReadQuery> {
    let mut query = query.cloned();
    if source.ingest_mode != IngestMode::Incremental
        || query.as_ref().is_some_and(|q| q.watermark.is_some())
    {
        return query;
    }
    let column = source.connection_properties.get(INCREMENTAL_COLUMN_PROPERTY);
    let value = source.connection_properties.get(WATERMARK_PROPERTY);
    if let (Some(column), Some(value)) = (column, value) {
        query.get_or_insert_with(ReadQuery::default).watermark = Some(Watermark {
            column: column.clone(),
            value: value.clone(),
        });
    }
    query
}
