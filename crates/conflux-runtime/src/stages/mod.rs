//! Stage abstractions
//!
//! Each stage takes a sequence of records and returns a new one:
//!
//! | Stage | Type | Calls out |
//! |-------|------|-----------|
//! | extract | [`Extractor`] | source connector |
//! | transform | [`Transformer`] | no |
//! | validate | [`Validator`] | no |
//! | enrich | [`Enrichment`] | HTTP enrichers |
//! | load | [`Loader`] | destination connector |
//!
//! Stages never keep records after they return. Every outbound call goes
//! through the [`Resilience`] layer in the [`StageContext`].

pub mod enrich;
pub mod extract;
pub mod load;
pub mod transform;
pub mod validate;

pub use enrich::{EnrichOutput, Enrichment};
pub use extract::{Extraction, Extractor};
pub use load::{LoadOutput, Loader};
pub use transform::{TransformOutput, Transformer};
pub use validate::{ValidationOutput, Validator};

use conflux_core::Connection;
use tokio_util::sync::CancellationToken;

use crate::resilience::Resilience;
use crate::telemetry::EventScope;

/// What a stage needs from the run it belongs to
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Run (and step) events are attributed to
    pub scope: EventScope,
    /// Outbound call policies
    pub resilience: Resilience,
    /// Shared HTTP client for enrichers
    pub http: reqwest::Client,
    /// Cooperative cancellation
    pub cancel: CancellationToken,
}

impl StageContext {
    /// Context with a fresh client and token, for tests and one-off calls
    pub fn detached(scope: EventScope, resilience: Resilience) -> Self {
        Self {
            scope,
            resilience,
            http: reqwest::Client::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Close a run-scoped connection, logging failures
pub(crate) async fn release(connection: Box<dyn Connection>, target: &str) {
    if let Err(e) = connection.close().await {
        tracing::warn!(endpoint = target, error = %e, "failed to close connection");
    }
}
