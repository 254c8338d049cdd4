//! HTTP/JSON connector (`RestApi`)
//!
//! ```yaml
//! type: RestApi
//! connectionProperties:
//!   url: https://api.example.com/orders
//!   method: GET              # default GET for sources, POST for destinations
//!   headers.Authorization: Bearer abc
//!   dataPath: data.items     # where the record array lives in the response
//!   pageParam: page          # query parameter incremented per page
//!   maxPages: "10"
//! ```
//!
//! 5xx, 408 and 429 responses are transient; other 4xx responses are not.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde_json::Value;

use super::{
    Connection, Connector, ConnectorRole, ConnectorSpec, ReadQuery, RecordStream, WriteCounts,
};
use crate::definitions::ConnectorKind;
use crate::error::{Error, Result};
use crate::record::Record;

/// Provider name used in target identities
pub const PROVIDER: &str = "http";

/// Reads pages from and posts batches to an HTTP endpoint
#[derive(Debug)]
pub struct RestConnector {
    spec: ConnectorSpec,
    settings: RestSettings,
    target: String,
    client: Client,
}

#[derive(Debug, Clone)]
struct RestSettings {
    url: String,
    method: Method,
    headers: HeaderMap,
    data_path: Option<String>,
    page_param: Option<String>,
    max_pages: usize,
}

impl RestConnector {
    /// Build from a spec; `url` is required
    pub fn new(spec: ConnectorSpec) -> Result<Self> {
        let url = spec.require("url")?.to_string();
        reqwest::Url::parse(&url)
            .map_err(|e| Error::config(format!("connector '{}': invalid url: {}", spec.id, e)))?;
        let default_method = match spec.role {
            ConnectorRole::Source => "GET",
            ConnectorRole::Destination => "POST",
        };
        let method = spec
            .property("method")
            .unwrap_or(default_method)
            .to_ascii_uppercase()
            .parse::<Method>()
            .map_err(|e| Error::config(format!("connector '{}': {}", spec.id, e)))?;
        let headers = header_map(&spec)?;
        let page_param = spec.property("pageParam").map(str::to_string);
        let default_pages = if page_param.is_some() { 100 } else { 1 };
        let settings = RestSettings {
            url: url.clone(),
            method,
            headers,
            data_path: spec.property("dataPath").map(str::to_string),
            max_pages: spec.parsed("maxPages", default_pages)?,
            page_param,
        };
        let target = spec.target(PROVIDER, &super::redact_url(&url));
        Ok(Self {
            spec,
            settings,
            target,
            client: Client::new(),
        })
    }
}

fn header_map(spec: &ConnectorSpec) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in spec.prefixed("headers") {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| Error::config(format!("invalid value for header '{name}': {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl Connector for RestConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::RestApi
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(RestConnection {
            client: self.client.clone(),
            settings: self.settings.clone(),
            target: self.target.clone(),
            source_id: self.spec.id.clone(),
            schema_id: self.spec.schema_id.clone(),
        }))
    }

    async fn test_connection(&self) -> bool {
        let response = self
            .client
            .head(&self.settings.url)
            .headers(self.settings.headers.clone())
            .send()
            .await;
        match response {
            Ok(r) => !r.status().is_server_error(),
            Err(e) => {
                tracing::debug!(endpoint = %self.target, error = %e, "connection test failed");
                false
            }
        }
    }
}

struct RestConnection {
    client: Client,
    settings: RestSettings,
    target: String,
    source_id: String,
    schema_id: Option<String>,
}

impl RestConnection {
    async fn fetch_page(&self, page: usize) -> Result<Vec<Value>> {
        let mut request = self
            .client
            .request(self.settings.method.clone(), &self.settings.url)
            .headers(self.settings.headers.clone());
        if let Some(param) = &self.settings.page_param {
            request = request.query(&[(param.as_str(), page.to_string())]);
        }
        let response = request.send().await?;
        let body = checked_body(&self.target, response).await?;
        Ok(super::records_at_path(body, self.settings.data_path.as_deref()))
    }

    fn record(&self, page: usize, value: Value) -> Record {
        let data = match value {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let record = Record::new(&self.source_id, data).with_metadata("page", page.to_string());
        match &self.schema_id {
            Some(schema) => record.with_schema(schema),
            None => record,
        }
    }
}

/// Turn a non-success response into [`Error::Remote`], otherwise parse JSON
pub(crate) async fn checked_body(target: &str, response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let mut message = response.text().await.unwrap_or_default();
        message.truncate(512);
        return Err(Error::Remote {
            target: target.to_string(),
            status: status.as_u16(),
            message,
        });
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl Connection for RestConnection {
    fn read<'a>(&'a self, _query: Option<&'a ReadQuery>) -> RecordStream<'a> {
        // (next page, finished)
        stream::unfold((1usize, false), move |(page, done)| async move {
            if done || page > self.settings.max_pages {
                return None;
            }
            match self.fetch_page(page).await {
                Ok(items) if items.is_empty() => None,
                Ok(items) => {
                    let records: Vec<Result<Record>> = items
                        .into_iter()
                        .map(|item| Ok(self.record(page, item)))
                        .collect();
                    Some((stream::iter(records), (page + 1, false)))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), (page, true))),
            }
        })
        .flatten()
        .boxed()
    }

    async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
        if records.is_empty() {
            return Ok(WriteCounts::default());
        }
        let body: Vec<&serde_json::Map<String, Value>> = records.iter().map(|r| &r.data).collect();
        let response = self
            .client
            .request(self.settings.method.clone(), &self.settings.url)
            .headers(self.settings.headers.clone())
            .json(&body)
            .send()
            .await?;
        checked_body(&self.target, response).await?;
        Ok(WriteCounts {
            written: records.len(),
            failed: 0,
        })
    }
}
