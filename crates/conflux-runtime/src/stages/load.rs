//! Load stage

use std::sync::Arc;

use conflux_core::{Connector, Error, Record, Result};

use super::{StageContext, release};
use crate::error::FailureDetail;

/// What the destination accepted
#[derive(Debug, Default)]
pub struct LoadOutput {
    /// Records the destination accepted
    pub written: usize,
    /// Records the destination refused or that were in a failed batch
    pub failed: usize,
    /// Batches attempted
    pub batches: usize,
    /// Outbound attempts, connect included
    pub attempts: u32,
    /// Failed batches that were skipped
    pub failures: Vec<FailureDetail>,
    /// Cancellation was observed between batches
    pub cancelled: bool,
    /// Batch failure that stopped the stage
    pub aborted: Option<Error>,
}

/// Writes records to a destination in batches
pub struct Loader {
    connector: Arc<dyn Connector>,
    batch_size: usize,
}

impl Loader {
    /// Loader over `connector`; a zero batch size writes one record per batch
    pub fn new(connector: Arc<dyn Connector>, batch_size: usize) -> Self {
        Self {
            connector,
            batch_size: batch_size.max(1),
        }
    }

    /// Identity of the destination
    pub fn target(&self) -> &str {
        self.connector.target()
    }

    /// Connect, write every batch, release the connection
    ///
    /// Only a failed connect is returned as an error. A batch that still
    /// fails after retries is counted as failed when `continue_on_error` is
    /// set, and otherwise stops the stage with the error in
    /// [`LoadOutput::aborted`]; either way the counts cover what was written.
    pub async fn load(
        &self,
        records: &[Record],
        ctx: &StageContext,
        continue_on_error: bool,
    ) -> Result<LoadOutput> {
        let target = self.connector.target();
        let connected = ctx
            .resilience
            .execute(&ctx.scope, target, || self.connector.connect())
            .await?;
        let connection = connected.value;
        let mut output = LoadOutput {
            attempts: connected.attempts,
            ..Default::default()
        };

        for batch in records.chunks(self.batch_size) {
            if ctx.cancel.is_cancelled() {
                output.cancelled = true;
                break;
            }
            output.batches += 1;
            match ctx
                .resilience
                .execute(&ctx.scope, target, || connection.write(batch))
                .await
            {
                Ok(attempted) => {
                    output.attempts += attempted.attempts;
                    output.written += attempted.value.written;
                    output.failed += attempted.value.failed;
                    tracing::debug!(
                        endpoint = target,
                        batch = output.batches,
                        written = attempted.value.written,
                        failed = attempted.value.failed,
                        "batch written"
                    );
                }
                Err(e) if continue_on_error => {
                    tracing::warn!(endpoint = target, batch = output.batches, error = %e, "batch failed");
                    output.failed += batch.len();
                    output
                        .failures
                        .push(FailureDetail::from_error(&e).at("load"));
                }
                Err(e) => {
                    output.aborted = Some(e);
                    break;
                }
            }
        }

        release(connection, target).await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerRegistry, Resilience};
    use crate::telemetry::{EventScope, NoopSink};
    use async_trait::async_trait;
    use conflux_core::config::ResilienceSettings;
    use conflux_core::connectors::{ReadQuery, RecordStream, WriteCounts};
    use conflux_core::definitions::ConnectorKind;
    use conflux_core::Connection;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::Mutex;

    /// Remembers batch sizes; refuses writes whose first record has `"bad": true`
    #[derive(Default)]
    struct Sink {
        batches: Mutex<Vec<usize>>,
        closed: Mutex<bool>,
    }

    struct SinkConnector(Arc<Sink>);

    struct SinkConnection(Arc<Sink>);

    #[async_trait]
    impl Connector for SinkConnector {
        fn kind(&self) -> ConnectorKind {
            ConnectorKind::Custom
        }
        fn provider(&self) -> &str {
            "sink"
        }
        fn target(&self) -> &str {
            "Custom:sink:test"
        }
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(SinkConnection(self.0.clone())))
        }
    }

    #[async_trait]
    impl Connection for SinkConnection {
        fn read<'a>(&'a self, _query: Option<&'a ReadQuery>) -> RecordStream<'a> {
            futures::stream::empty().boxed()
        }

        async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
            if records.first().and_then(|r| r.get("bad")) == Some(&json!(true)) {
                return Err(Error::Write {
                    target: "Custom:sink:test".to_string(),
                    message: "refused".to_string(),
                });
            }
            self.0.batches.lock().unwrap().push(records.len());
            Ok(WriteCounts {
                written: records.len(),
                failed: 0,
            })
        }

        async fn close(&self) -> Result<()> {
            *self.0.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    fn ctx() -> StageContext {
        let settings = ResilienceSettings {
            max_attempts: 2,
            jitter: 0.0,
            ..Default::default()
        };
        StageContext::detached(
            EventScope::run("run"),
            Resilience::new(settings, CircuitBreakerRegistry::new(), Arc::new(NoopSink)),
        )
    }

    fn records(n: usize, bad: &[usize]) -> Vec<Record> {
        (0..n)
            .map(|i| Record::from_value("s", json!({"n": i, "bad": bad.contains(&i)})))
            .collect()
    }

    fn loader(batch_size: usize) -> (Loader, Arc<Sink>) {
        let sink = Arc::new(Sink::default());
        (Loader::new(Arc::new(SinkConnector(sink.clone())), batch_size), sink)
    }

    #[tokio::test]
    async fn test_writes_in_batches() {
        let (loader, sink) = loader(4);
        let out = loader.load(&records(10, &[]), &ctx(), false).await.unwrap();
        assert_eq!(out.written, 10);
        assert_eq!(out.batches, 3);
        assert_eq!(*sink.batches.lock().unwrap(), vec![4, 4, 2]);
        assert!(*sink.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_aborts_without_continue() {
        let (loader, sink) = loader(2);
        let out = loader.load(&records(6, &[2]), &ctx(), false).await.unwrap();
        assert_eq!(out.written, 2);
        assert!(matches!(out.aborted, Some(Error::Write { .. })));
        assert!(*sink.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_failed_batch_counted_with_continue() {
        let (loader, _) = loader(2);
        let out = loader.load(&records(6, &[2]), &ctx(), true).await.unwrap();
        assert_eq!(out.written, 4);
        assert_eq!(out.failed, 2);
        assert_eq!(out.failures.len(), 1);
        assert!(out.aborted.is_none());
        // a write error is not transient: one attempt per batch plus connect
        assert_eq!(out.attempts, 4);
    }

    #[tokio::test]
    async fn test_cancel_stops_between_batches() {
        let (loader, sink) = loader(2);
        let ctx = ctx();
        ctx.cancel.cancel();
        let out = loader.load(&records(6, &[]), &ctx, false).await.unwrap();
        assert!(out.cancelled);
        assert_eq!(out.written, 0);
        assert!(sink.batches.lock().unwrap().is_empty());
        assert!(*sink.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_zero_batch_size_is_one() {
        let (loader, sink) = loader(0);
        loader.load(&records(3, &[]), &ctx(), false).await.unwrap();
        assert_eq!(*sink.batches.lock().unwrap(), vec![1, 1, 1]);
    }
}
