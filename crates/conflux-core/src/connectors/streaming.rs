//! Streaming and message queue connectors (`Streaming` / `MessageQueue`)
//!
//! Both providers speak HTTP so they share the REST client stack:
//!
//! - `kafka` - Confluent Kafka REST proxy, API v2 (produce and consume)
//! - `eventhubs` - Azure Event Hubs REST send API (write only)
//!
//! ```yaml
//! type: Streaming
//! connectionProperties:
//!   provider: kafka
//!   url: http://kafka-rest:8082
//!   topic: orders
//!   consumerGroup: conflux      # reads only
//!   keyField: order_id          # optional message key
//!   maxPolls: "3"
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};

use super::rest::checked_body;
use super::{Connection, Connector, ConnectorSpec, ReadQuery, RecordStream, WriteCounts};
use crate::definitions::ConnectorKind;
use crate::error::{Error, Result};
use crate::record::Record;

const KAFKA_JSON: &str = "application/vnd.kafka.json.v2+json";
const KAFKA_V2: &str = "application/vnd.kafka.v2+json";
const SERVICE_BUS_JSON: &str = "application/vnd.microsoft.servicebus.json";

/// Kafka through the REST proxy
#[derive(Debug)]
pub struct KafkaConnector {
    spec: ConnectorSpec,
    base_url: String,
    topic: String,
    target: String,
    client: Client,
}

impl KafkaConnector {
    /// Provider name
    pub const PROVIDER: &'static str = "kafka";

    /// Build from a spec; `url` and `topic` are required
    pub fn new(spec: ConnectorSpec) -> Result<Self> {
        let base_url = spec.require("url")?.trim_end_matches('/').to_string();
        let topic = spec.require("topic")?.to_string();
        let target = spec.target(
            Self::PROVIDER,
            &format!(
                "{}/topics/{}",
                super::redact_url(&base_url).trim_end_matches('/'),
                topic
            ),
        );
        Ok(Self {
            spec,
            base_url,
            topic,
            target,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    fn kind(&self) -> ConnectorKind {
        self.spec.kind
    }

    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(KafkaConnection {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            topic: self.topic.clone(),
            target: self.target.clone(),
            group: self
                .spec
                .property("consumerGroup")
                .unwrap_or("conflux")
                .to_string(),
            key_field: self.spec.property("keyField").map(str::to_string),
            max_polls: self.spec.parsed("maxPolls", 1usize)?,
            source_id: self.spec.id.clone(),
            schema_id: self.spec.schema_id.clone(),
        }))
    }

    async fn test_connection(&self) -> bool {
        let url = format!("{}/topics/{}", self.base_url, self.topic);
        match self.client.get(&url).header(ACCEPT, KAFKA_V2).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(endpoint = %self.target, error = %e, "connection test failed");
                false
            }
        }
    }
}

struct KafkaConnection {
    client: Client,
    base_url: String,
    topic: String,
    target: String,
    group: String,
    key_field: Option<String>,
    max_polls: usize,
    source_id: String,
    schema_id: Option<String>,
}

#[derive(Deserialize)]
struct ConsumerInstance {
    base_uri: String,
}

#[derive(Deserialize)]
struct ConsumedMessage {
    #[serde(default)]
    key: Value,
    value: Value,
    partition: i64,
    offset: i64,
}

impl KafkaConnection {
    /// Create a consumer instance, subscribe, poll, then delete the instance
    async fn consume(&self, limit: Option<usize>) -> Result<Vec<Record>> {
        let instance = format!("conflux-{}", uuid::Uuid::new_v4());
        let created = self
            .client
            .post(format!("{}/consumers/{}", self.base_url, self.group))
            .header(CONTENT_TYPE, KAFKA_V2)
            .json(&json!({
                "name": instance,
                "format": "json",
                "auto.offset.reset": "earliest",
            }))
            .send()
            .await?;
        let consumer: ConsumerInstance =
            serde_json::from_value(checked_body(&self.target, created).await?)?;

        let result = self.poll(&consumer.base_uri, limit).await;

        let deleted = self
            .client
            .delete(&consumer.base_uri)
            .header(CONTENT_TYPE, KAFKA_V2)
            .send()
            .await;
        if let Err(e) = deleted {
            tracing::warn!(endpoint = %self.target, error = %e, "failed to delete consumer instance");
        }
        result
    }

    async fn poll(&self, base_uri: &str, limit: Option<usize>) -> Result<Vec<Record>> {
        let subscribed = self
            .client
            .post(format!("{base_uri}/subscription"))
            .header(CONTENT_TYPE, KAFKA_V2)
            .json(&json!({ "topics": [self.topic] }))
            .send()
            .await?;
        checked_body(&self.target, subscribed).await?;

        let mut records = Vec::new();
        for _ in 0..self.max_polls {
            let response = self
                .client
                .get(format!("{base_uri}/records"))
                .header(ACCEPT, KAFKA_JSON)
                .send()
                .await?;
            let messages: Vec<ConsumedMessage> =
                serde_json::from_value(checked_body(&self.target, response).await?)?;
            if messages.is_empty() {
                break;
            }
            for message in messages {
                records.push(self.record(message));
            }
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
        }
        Ok(records)
    }

    fn record(&self, message: ConsumedMessage) -> Record {
        let data = match message.value {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let mut record = Record::new(&self.source_id, data)
            .with_metadata("topic", self.topic.clone())
            .with_metadata("partition", message.partition.to_string())
            .with_metadata("offset", message.offset.to_string());
        if let Some(key) = message.key.as_str() {
            record = record.with_metadata("key", key);
        }
        match &self.schema_id {
            Some(schema) => record.with_schema(schema),
            None => record,
        }
    }
}

#[async_trait]
impl Connection for KafkaConnection {
    fn read<'a>(&'a self, query: Option<&'a ReadQuery>) -> RecordStream<'a> {
        let limit = query.and_then(|q| q.limit);
        stream::once(async move { self.consume(limit).await })
            .flat_map(|result| {
                let items: Vec<Result<Record>> = match result {
                    Ok(records) => records.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
        if records.is_empty() {
            return Ok(WriteCounts::default());
        }
        let payload: Vec<Value> = records
            .iter()
            .map(|r| {
                let key = self
                    .key_field
                    .as_deref()
                    .and_then(|f| r.get(f))
                    .cloned()
                    .unwrap_or(Value::Null);
                json!({ "key": key, "value": r.data })
            })
            .collect();
        let response = self
            .client
            .post(format!("{}/topics/{}", self.base_url, self.topic))
            .header(CONTENT_TYPE, KAFKA_JSON)
            .header(ACCEPT, KAFKA_V2)
            .json(&json!({ "records": payload }))
            .send()
            .await?;
        let body = checked_body(&self.target, response).await?;
        // the proxy reports per-record failures inline
        let failed = body
            .get("offsets")
            .and_then(Value::as_array)
            .map(|offsets| {
                offsets
                    .iter()
                    .filter(|o| o.get("error_code").is_some_and(|c| !c.is_null()))
                    .count()
            })
            .unwrap_or(0);
        Ok(WriteCounts {
            written: records.len() - failed,
            failed,
        })
    }
}

/// Azure Event Hubs through the REST send API
#[derive(Debug)]
pub struct EventHubsConnector {
    spec: ConnectorSpec,
    url: String,
    sas_token: String,
    target: String,
    client: Client,
}

impl EventHubsConnector {
    /// Provider name
    pub const PROVIDER: &'static str = "eventhubs";

    /// Build from a spec; `url`, `hub` and `sasToken` are required
    pub fn new(spec: ConnectorSpec) -> Result<Self> {
        let namespace = spec.require("url")?.trim_end_matches('/').to_string();
        let hub = spec.require("hub")?;
        let url = format!("{namespace}/{hub}/messages");
        let sas_token = spec.require("sasToken")?.to_string();
        let target = spec.target(Self::PROVIDER, &super::redact_url(&url));
        Ok(Self {
            spec,
            url,
            sas_token,
            target,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl Connector for EventHubsConnector {
    fn kind(&self) -> ConnectorKind {
        self.spec.kind
    }

    fn provider(&self) -> &str {
        Self::PROVIDER
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(EventHubsConnection {
            client: self.client.clone(),
            url: self.url.clone(),
            sas_token: self.sas_token.clone(),
            target: self.target.clone(),
            kind: self.spec.kind,
        }))
    }
}

struct EventHubsConnection {
    client: Client,
    url: String,
    sas_token: String,
    target: String,
    kind: ConnectorKind,
}

#[async_trait]
impl Connection for EventHubsConnection {
    fn read<'a>(&'a self, _query: Option<&'a ReadQuery>) -> RecordStream<'a> {
        let err = Error::Unsupported {
            kind: format!("{} reads", self.kind),
            provider: Some(EventHubsConnector::PROVIDER.to_string()),
        };
        stream::once(async move { Err(err) }).boxed()
    }

    async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
        if records.is_empty() {
            return Ok(WriteCounts::default());
        }
        let batch = records
            .iter()
            .map(|r| -> Result<Value> { Ok(json!({ "Body": serde_json::to_string(&r.data)? })) })
            .collect::<Result<Vec<Value>>>()?;
        let response = self
            .client
            .post(&self.url)
            .header(AUTHORIZATION, &self.sas_token)
            .header(CONTENT_TYPE, SERVICE_BUS_JSON)
            .json(&batch)
            .send()
            .await?;
        checked_body(&self.target, response).await?;
        Ok(WriteCounts {
            written: records.len(),
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::{DestinationDefinition, DestinationType};

    fn spec(properties: &[(&str, &str)]) -> ConnectorSpec {
        ConnectorSpec::from_destination(&DestinationDefinition {
            id: "bus".to_string(),
            name: "Bus".to_string(),
            destination_type: DestinationType::MessageQueue,
            connection_properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    #[test]
    fn test_kafka_requires_topic() {
        let err = KafkaConnector::new(spec(&[("url", "http://proxy:8082")])).unwrap_err();
        assert!(err.to_string().contains("'topic'"));
    }

    #[test]
    fn test_kafka_target_includes_topic() {
        let connector =
            KafkaConnector::new(spec(&[("url", "http://proxy:8082/"), ("topic", "orders")]))
                .unwrap();
        assert_eq!(connector.kind(), ConnectorKind::MessageQueue);
        assert_eq!(
            connector.target(),
            "MessageQueue:kafka:http://proxy:8082/topics/orders"
        );
    }

    #[tokio::test]
    async fn test_eventhubs_reads_are_unsupported() {
        let connector = EventHubsConnector::new(spec(&[
            ("url", "https://ns.servicebus.windows.net"),
            ("hub", "events"),
            ("sasToken", "SharedAccessSignature sr=x"),
        ]))
        .unwrap();
        let connection = connector.connect().await.unwrap();
        let items: Vec<Result<Record>> = connection.read(None).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(Error::Unsupported { .. })));
    }

    #[test]
    fn test_eventhubs_requires_token() {
        assert!(
            EventHubsConnector::new(spec(&[
                ("url", "https://ns.servicebus.windows.net"),
                ("hub", "events"),
            ]))
            .is_err()
        );
    }
}
