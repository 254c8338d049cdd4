//! Connector registry
//!
//! Maps `(kind, provider)` to a constructor. The engine never matches on
//! provider names itself: resolving a definition is a table lookup, and new
//! providers are added with [`ConnectorRegistry::register`].
//!
//! Provider rules per kind:
//!
//! - `Database`, `Streaming`, `MessageQueue`, `Custom` - `provider` required
//! - `FileSystem` - `provider` optional, defaults to `local`
//! - `RestApi`, `Ftp`, `DataLake`, `BlobStorage` - `provider` optional
//!
//! Anything without a registration fails with [`Error::Unsupported`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::connectors::database::{DatabaseConnector, Dialect};
use crate::connectors::file::{self, FileConnector};
use crate::connectors::memory::{self, MemoryConnector, MemoryStore};
use crate::connectors::rest::RestConnector;
use crate::connectors::streaming::{EventHubsConnector, KafkaConnector};
use crate::connectors::{Connector, ConnectorSpec};
use crate::definitions::{ConnectorKind, DestinationDefinition, SourceDefinition};
use crate::error::{Error, Result};

/// Builds a connector from a spec
pub type ConnectorConstructor =
    Arc<dyn Fn(ConnectorSpec) -> Result<Arc<dyn Connector>> + Send + Sync>;

enum ProviderRule {
    Required,
    Default(&'static str),
    Optional,
}

fn provider_rule(kind: ConnectorKind) -> ProviderRule {
    match kind {
        ConnectorKind::Database
        | ConnectorKind::Streaming
        | ConnectorKind::MessageQueue
        | ConnectorKind::Custom => ProviderRule::Required,
        ConnectorKind::FileSystem => ProviderRule::Default(file::PROVIDER),
        ConnectorKind::RestApi
        | ConnectorKind::Ftp
        | ConnectorKind::DataLake
        | ConnectorKind::BlobStorage => ProviderRule::Optional,
    }
}

/// Registry of connector constructors
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    constructors: BTreeMap<(ConnectorKind, Option<String>), ConnectorConstructor>,
    memory: MemoryStore,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("registered", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ConnectorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in provider
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(ConnectorKind::FileSystem, Some(file::PROVIDER), |spec| {
            Ok(Arc::new(FileConnector::new(spec)?))
        });
        registry.register(ConnectorKind::RestApi, None, |spec| {
            Ok(Arc::new(RestConnector::new(spec)?))
        });
        for dialect in [Dialect::Postgres, Dialect::MySql, Dialect::SqlServer] {
            registry.register(
                ConnectorKind::Database,
                Some(dialect.provider()),
                move |spec| Ok(Arc::new(DatabaseConnector::new(spec, dialect)?)),
            );
        }
        for kind in [ConnectorKind::Streaming, ConnectorKind::MessageQueue] {
            registry.register(kind, Some(KafkaConnector::PROVIDER), |spec| {
                Ok(Arc::new(KafkaConnector::new(spec)?))
            });
            registry.register(kind, Some(EventHubsConnector::PROVIDER), |spec| {
                Ok(Arc::new(EventHubsConnector::new(spec)?))
            });
        }
        let store = registry.memory.clone();
        registry.register(ConnectorKind::Custom, Some(memory::PROVIDER), move |spec| {
            Ok(Arc::new(MemoryConnector::new(spec, store.clone())?))
        });

        registry
    }

    /// Register (or replace) the constructor for `kind` and `provider`
    pub fn register<F>(&mut self, kind: ConnectorKind, provider: Option<&str>, constructor: F)
    where
        F: Fn(ConnectorSpec) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        let provider = provider.map(crate::connectors::normalize_provider);
        self.constructors
            .insert((kind, provider), Arc::new(constructor));
    }

    /// Whether a constructor exists for `kind` and `provider`
    pub fn contains(&self, kind: ConnectorKind, provider: Option<&str>) -> bool {
        let provider = provider.map(crate::connectors::normalize_provider);
        self.constructors.contains_key(&(kind, provider))
    }

    /// Registered providers of a kind (`None` for provider-less registrations)
    pub fn providers(&self, kind: ConnectorKind) -> Vec<Option<&str>> {
        self.constructors
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.as_deref())
            .collect()
    }

    /// Datasets behind the `Custom/memory` provider
    pub fn memory_store(&self) -> &MemoryStore {
        &self.memory
    }

    /// Resolve a spec to a connector
    pub fn resolve(&self, mut spec: ConnectorSpec) -> Result<Arc<dyn Connector>> {
        let provider = match (provider_rule(spec.kind), spec.provider.take()) {
            (_, Some(provider)) => Some(provider),
            (ProviderRule::Required, None) => {
                return Err(Error::config(format!(
                    "{} '{}' needs a 'provider' connection property",
                    spec.kind, spec.id
                )));
            }
            (ProviderRule::Default(default), None) => Some(default.to_string()),
            (ProviderRule::Optional, None) => None,
        };
        spec.provider = provider.clone();
        let key = (spec.kind, provider);
        let constructor = self
            .constructors
            .get(&key)
            .ok_or_else(|| Error::Unsupported {
                kind: key.0.to_string(),
                provider: key.1.clone(),
            })?;
        tracing::debug!(
            connector = %spec.id,
            kind = %spec.kind,
            provider = ?spec.provider,
            "resolving connector"
        );
        constructor(spec)
    }

    /// Resolve a source definition
    pub fn source(
        &self,
        def: &SourceDefinition,
        base_path: Option<&Path>,
    ) -> Result<Arc<dyn Connector>> {
        let spec = ConnectorSpec::from_source(def);
        self.resolve(match base_path {
            Some(base) => spec.with_base_path(base),
            None => spec,
        })
    }

    /// Resolve a destination definition
    pub fn destination(
        &self,
        def: &DestinationDefinition,
        base_path: Option<&Path>,
    ) -> Result<Arc<dyn Connector>> {
        let spec = ConnectorSpec::from_destination(def);
        self.resolve(match base_path {
            Some(base) => spec.with_base_path(base),
            None => spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{DestinationType, SourceType};
    use rstest::rstest;
    use serde_json::json;

    fn source(source_type: SourceType, properties: serde_json::Value) -> SourceDefinition {
        serde_json::from_value(json!({
            "id": "src",
            "name": "Source",
            "type": source_type,
            "connectionProperties": properties,
        }))
        .unwrap()
    }

    #[rstest]
    #[case("sqlserver")]
    #[case("mysql")]
    #[case("postgresql")]
    #[case("MySQL")]
    fn test_database_providers_resolve_to_matching_variant(#[case] provider: &str) {
        let registry = ConnectorRegistry::with_defaults();
        let def = source(
            SourceType::Database,
            json!({"provider": provider, "url": "postgres://h/db", "table": "orders"}),
        );
        let connector = registry.source(&def, None).unwrap();
        assert_eq!(connector.kind(), ConnectorKind::Database);
        assert_eq!(connector.provider(), provider.to_ascii_lowercase());
    }

    #[rstest]
    #[case(SourceType::Database, json!({"provider": "oracle", "url": "x", "table": "t"}))]
    #[case(SourceType::Streaming, json!({"provider": "pulsar", "url": "x"}))]
    #[case(SourceType::FileSystem, json!({"provider": "sftp", "path": "/data"}))]
    #[case(SourceType::Ftp, json!({"url": "ftp://h"}))]
    #[case(SourceType::Custom, json!({"provider": "nothing"}))]
    fn test_unregistered_provider_is_unsupported(
        #[case] source_type: SourceType,
        #[case] properties: serde_json::Value,
    ) {
        let registry = ConnectorRegistry::with_defaults();
        let err = registry.source(&source(source_type, properties), None).unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[rstest]
    #[case(SourceType::Database)]
    #[case(SourceType::Streaming)]
    fn test_missing_provider_is_configuration_error(#[case] source_type: SourceType) {
        let registry = ConnectorRegistry::with_defaults();
        let err = registry
            .source(&source(source_type, json!({"url": "x"})), None)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_file_system_defaults_to_local() {
        let registry = ConnectorRegistry::with_defaults();
        let connector = registry
            .source(
                &source(SourceType::FileSystem, json!({"path": "in.jsonl"})),
                Some(Path::new("/project")),
            )
            .unwrap();
        assert_eq!(connector.provider(), "local");
        assert_eq!(connector.target(), "FileSystem:local:/project/in.jsonl");
    }

    #[test]
    fn test_rest_api_needs_no_provider() {
        let registry = ConnectorRegistry::with_defaults();
        let connector = registry
            .source(
                &source(SourceType::RestApi, json!({"url": "https://api.example.com/a"})),
                None,
            )
            .unwrap();
        assert_eq!(connector.kind(), ConnectorKind::RestApi);
    }

    #[test]
    fn test_message_queue_destination_uses_streaming_providers() {
        let registry = ConnectorRegistry::with_defaults();
        let def = DestinationDefinition {
            id: "q".to_string(),
            name: "Q".to_string(),
            destination_type: DestinationType::MessageQueue,
            connection_properties: [
                ("provider".to_string(), "kafka".to_string()),
                ("url".to_string(), "http://proxy:8082".to_string()),
                ("topic".to_string(), "out".to_string()),
            ]
            .into_iter()
            .collect(),
        };
        let connector = registry.destination(&def, None).unwrap();
        assert_eq!(connector.provider(), "kafka");
        assert_eq!(connector.kind(), ConnectorKind::MessageQueue);
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = ConnectorRegistry::new();
        assert!(!registry.contains(ConnectorKind::DataLake, Some("delta")));
        let store = MemoryStore::new();
        registry.register(ConnectorKind::DataLake, Some("Delta"), move |spec| {
            Ok(Arc::new(MemoryConnector::new(spec, store.clone())?))
        });
        assert!(registry.contains(ConnectorKind::DataLake, Some("delta")));
        assert_eq!(
            registry.providers(ConnectorKind::DataLake),
            vec![Some("delta")]
        );
    }
}
