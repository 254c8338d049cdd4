//! Engine facade
//!
//! An [`Engine`] owns everything runs share: the connector registry, the
//! circuit breaker table, the telemetry sink and the project defaults.
//! Runs share nothing else, so any number of them can execute at once.
//!
//! ```rust,ignore
//! let config = Config::load(".")?;
//! let engine = Engine::new(&config);
//! let request = load_pipeline_request("runs/orders.yaml")?;
//! let result = engine.run_pipeline(&request, &CancellationToken::new()).await;
//! println!("{}: {} records", result.status, result.records_out);
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use conflux_core::config::{PipelineSettings, WorkflowSettings};
use conflux_core::{
    Config, Connector, ConnectorRegistry, DestinationDefinition, Result, SchemaCatalog,
    SourceDefinition,
};

use crate::pipeline::PipelineProcessor;
use crate::requests::{PipelineRequest, WorkflowRequest};
use crate::resilience::{CircuitBreakerRegistry, Resilience, timeout};
use crate::result::{PipelineRunResult, WorkflowRunResult};
use crate::stages::StageContext;
use crate::telemetry::{EventScope, SharedSink, TracingSink};
use crate::workflow::WorkflowEngine;

/// State shared by every run of an engine
#[derive(Debug, Clone)]
pub struct Services {
    /// Connector factory
    pub registry: Arc<ConnectorRegistry>,
    /// Outbound call policies and the breaker table
    pub resilience: Resilience,
    /// Project schemas
    pub catalog: Arc<SchemaCatalog>,
    /// HTTP client for enrichers
    pub http: reqwest::Client,
    /// Directory relative connector paths resolve against
    pub base_path: Option<PathBuf>,
    /// Pipeline defaults
    pub pipeline: PipelineSettings,
    /// Workflow defaults
    pub workflow: WorkflowSettings,
    /// Project variables, the base of every workflow context
    pub vars: Map<String, Value>,
}

impl Default for Services {
    fn default() -> Self {
        Self {
            registry: Arc::new(ConnectorRegistry::with_defaults()),
            resilience: Resilience::default(),
            catalog: Arc::new(SchemaCatalog::new()),
            http: reqwest::Client::new(),
            base_path: None,
            pipeline: PipelineSettings::default(),
            workflow: WorkflowSettings::default(),
            vars: Map::new(),
        }
    }
}

impl Services {
    /// Stage context for one run or step
    pub fn stage_context(&self, scope: EventScope, cancel: CancellationToken) -> StageContext {
        StageContext {
            scope,
            resilience: self.resilience.clone(),
            http: self.http.clone(),
            cancel,
        }
    }
}

/// Runs pipelines and workflows
#[derive(Debug, Clone)]
pub struct Engine {
    services: Arc<Services>,
    pipelines: PipelineProcessor,
    workflows: WorkflowEngine,
}

impl Engine {
    /// Engine with the default registry, a fresh breaker table and tracing telemetry
    pub fn new(config: &Config) -> Self {
        Self::builder(config).build()
    }

    /// Start building an engine for a project
    pub fn builder(config: &Config) -> EngineBuilder {
        EngineBuilder {
            config: config.clone(),
            registry: None,
            telemetry: None,
            breakers: None,
        }
    }

    /// Shared services
    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// The connector registry
    pub fn registry(&self) -> &ConnectorRegistry {
        &self.services.registry
    }

    /// The breaker table
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        self.services.resilience.breakers()
    }

    /// Run a pipeline request to completion
    pub async fn run_pipeline(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> PipelineRunResult {
        self.pipelines
            .run(&request.source, &request.destination, &request.config, cancel)
            .await
    }

    /// Run a workflow request to completion
    pub async fn run_workflow(
        &self,
        request: &WorkflowRequest,
        cancel: &CancellationToken,
    ) -> WorkflowRunResult {
        self.workflows
            .run(
                &request.workflow,
                &request.definitions,
                request.context.clone(),
                cancel,
            )
            .await
    }

    /// Run a pipeline on its own task
    pub fn spawn_pipeline(
        &self,
        request: PipelineRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<PipelineRunResult> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_pipeline(&request, &cancel).await })
    }

    /// Run a workflow on its own task
    pub fn spawn_workflow(
        &self,
        request: WorkflowRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<WorkflowRunResult> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_workflow(&request, &cancel).await })
    }

    /// Whether a source is reachable within its target's timeout
    pub async fn test_source(&self, source: &SourceDefinition) -> Result<bool> {
        let connector = self
            .services
            .registry
            .source(source, self.services.base_path.as_deref())?;
        Ok(self.reachable(connector.as_ref()).await)
    }

    /// Whether a destination is reachable within its target's timeout
    pub async fn test_destination(&self, destination: &DestinationDefinition) -> Result<bool> {
        let connector = self
            .services
            .registry
            .destination(destination, self.services.base_path.as_deref())?;
        Ok(self.reachable(connector.as_ref()).await)
    }

    async fn reachable(&self, connector: &dyn Connector) -> bool {
        let target = connector.target();
        let limit = self.services.resilience.policy_for(target).timeout;
        match timeout::bounded(target, limit, async { Ok(connector.test_connection().await) }).await
        {
            Ok(reachable) => reachable,
            Err(e) => {
                tracing::warn!(endpoint = target, error = %e, "connection test did not finish");
                false
            }
        }
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: Config,
    registry: Option<ConnectorRegistry>,
    telemetry: Option<SharedSink>,
    breakers: Option<CircuitBreakerRegistry>,
}

impl EngineBuilder {
    /// Use a registry with extra providers registered
    pub fn with_registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Send telemetry somewhere other than `tracing`
    pub fn with_telemetry(mut self, sink: SharedSink) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Share a breaker table with other engines
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Build the engine
    pub fn build(self) -> Engine {
        let project = &self.config.project;
        let resilience = Resilience::new(
            project.resilience.clone(),
            self.breakers.unwrap_or_default(),
            self.telemetry.unwrap_or_else(|| Arc::new(TracingSink)),
        );
        let vars: BTreeMap<String, Value> = project.vars.clone().into_iter().collect();
        let services = Arc::new(Services {
            registry: Arc::new(self.registry.unwrap_or_else(ConnectorRegistry::with_defaults)),
            resilience,
            catalog: Arc::new(self.config.schema_catalog()),
            http: reqwest::Client::new(),
            base_path: Some(self.config.base_path.clone()),
            pipeline: project.pipeline.clone(),
            workflow: project.workflow.clone(),
            vars: vars.into_iter().collect(),
        });
        tracing::debug!(project = %project.name, base_path = %self.config.base_path.display(), "engine ready");
        Engine {
            pipelines: PipelineProcessor::new(services.clone()),
            workflows: WorkflowEngine::new(services.clone()),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::telemetry::{CollectingSink, EventKind};
    use serde_json::json;

    #[test]
    fn test_builder_takes_project_settings() {
        let mut config = Config::standalone("/tmp/project");
        config.project.pipeline.batch_size = 42;
        config.project.vars.insert("region".to_string(), json!("EU"));
        let engine = Engine::new(&config);
        assert_eq!(engine.services().pipeline.batch_size, 42);
        assert_eq!(engine.services().vars.get("region"), Some(&json!("EU")));
        assert_eq!(
            engine.services().base_path.as_deref(),
            Some(std::path::Path::new("/tmp/project"))
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_breakers_only() {
        let sink = CollectingSink::new();
        let breakers = CircuitBreakerRegistry::new();
        let engine = Engine::builder(&Config::standalone("."))
            .with_telemetry(Arc::new(sink.clone()))
            .with_breakers(breakers.clone())
            .build();
        let store = engine.registry().memory_store();
        for i in 0..4 {
            store.insert(
                format!("in-{i}"),
                (0..5).map(|n| conflux_core::Record::from_value("s", json!({"n": n}))).collect(),
            );
        }

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let request: PipelineRequest = serde_json::from_value(json!({
                    "source": {"id": format!("in-{i}"), "name": "In", "type": "Custom",
                               "connectionProperties": {"provider": "memory"}},
                    "destination": {"id": format!("out-{i}"), "name": "Out", "type": "Custom",
                                    "connectionProperties": {"provider": "memory"}}
                }))
                .unwrap();
                engine.spawn_pipeline(request, CancellationToken::new())
            })
            .collect();

        let mut run_ids = std::collections::HashSet::new();
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.status.is_success());
            assert_eq!(result.records_out, 5);
            run_ids.insert(result.run_id);
        }
        assert_eq!(run_ids.len(), 4);
        for i in 0..4 {
            assert_eq!(store.len(&format!("out-{i}")), 5);
        }
        assert_eq!(sink.of_kind(EventKind::RunFinished).len(), 4);
        assert_eq!(breakers.state("Custom:memory:in-0"), CircuitState::Closed);
        assert_eq!(engine.breakers().consecutive_failures("Custom:memory:out-3"), 0);
    }

    #[tokio::test]
    async fn test_connection_checks() {
        let engine = Engine::new(&Config::standalone("."));
        let source: SourceDefinition = serde_json::from_value(json!({
            "id": "mem", "name": "Mem", "type": "Custom",
            "connectionProperties": {"provider": "memory"}
        }))
        .unwrap();
        assert!(engine.test_source(&source).await.unwrap());

        let destination: DestinationDefinition = serde_json::from_value(json!({
            "id": "lake", "name": "Lake", "type": "DataLake"
        }))
        .unwrap();
        assert!(engine.test_destination(&destination).await.is_err());
    }

    struct Hanging;

    #[async_trait::async_trait]
    impl Connector for Hanging {
        fn kind(&self) -> conflux_core::ConnectorKind {
            conflux_core::ConnectorKind::Custom
        }
        fn provider(&self) -> &str {
            "hanging"
        }
        fn target(&self) -> &str {
            "Custom:hanging:h"
        }
        async fn connect(&self) -> Result<Box<dyn conflux_core::Connection>> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Err(conflux_core::Error::connection("h", "gave up"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_check_is_bounded() {
        let mut config = Config::standalone(".");
        config.project.resilience.timeout_ms = 250;
        let mut registry = ConnectorRegistry::with_defaults();
        registry.register(conflux_core::ConnectorKind::Custom, Some("hanging"), |_| {
            Ok(Arc::new(Hanging))
        });
        let engine = Engine::builder(&config).with_registry(registry).build();
        let source: SourceDefinition = serde_json::from_value(json!({
            "id": "h", "name": "H", "type": "Custom",
            "connectionProperties": {"provider": "hanging"}
        }))
        .unwrap();

        let started = tokio::time::Instant::now();
        assert!(!engine.test_source(&source).await.unwrap());
        assert_eq!(started.elapsed(), std::time::Duration::from_millis(250));
    }
}
