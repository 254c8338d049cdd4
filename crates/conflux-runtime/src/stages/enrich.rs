//! Enrich stage
//!
//! Enrichers run in declared order on every record:
//!
//! - `lookup` joins against a static table, indexed once when the stage is built
//! - `http` fetches per record through the resilience layer; its target
//!   identity is `http:<url origin>`
//! - `metadata` stamps run and source information into record metadata

use chrono::Utc;
use minijinja::Environment;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use conflux_core::condition::lookup_path;
use conflux_core::enrichment::{EnricherConfig, EnrichmentConfig, OnMiss};
use conflux_core::{Error, Record, Result};

use super::StageContext;
use crate::error::FailureDetail;

const URL_TEMPLATE: &str = "url";

/// Records after enrichment
#[derive(Debug, Default)]
pub struct EnrichOutput {
    /// Enriched records
    pub records: Vec<Record>,
    /// Records skipped after an enricher failed on them
    pub failures: Vec<FailureDetail>,
    /// Outbound attempts made by HTTP enrichers
    pub attempts: u32,
}

/// Compiled enrichers
pub struct Enrichment {
    enrichers: Vec<Enricher>,
}

enum Enricher {
    Lookup(LookupEnricher),
    Http(HttpEnricher),
    Metadata(BTreeMap<String, String>),
}

impl Enrichment {
    /// Compile an enrichment config
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let enrichers = config
            .enrichers
            .iter()
            .map(|enricher| match enricher {
                EnricherConfig::Lookup {
                    key_field,
                    lookup_key,
                    table,
                    fields,
                    prefix,
                    on_miss,
                } => Ok(Enricher::Lookup(LookupEnricher {
                    key_field: key_field.clone(),
                    index: index_table(table, lookup_key),
                    columns: lookup_columns(table, lookup_key, fields),
                    prefix: prefix.clone().unwrap_or_default(),
                    on_miss: *on_miss,
                })),
                EnricherConfig::Http {
                    url,
                    method,
                    headers,
                    target_field,
                    data_path,
                    on_miss,
                } => Ok(Enricher::Http(HttpEnricher {
                    templates: url_template(url)?,
                    method: Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                        .map_err(|_| Error::config(format!("http enricher: invalid method '{method}'")))?,
                    headers: header_map(headers)?,
                    target_field: target_field.clone(),
                    data_path: data_path.clone(),
                    on_miss: *on_miss,
                })),
                EnricherConfig::Metadata { values } => Ok(Enricher::Metadata(values.clone())),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { enrichers })
    }

    /// Whether there is nothing to do
    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }

    /// Enrich every record
    ///
    /// A failing record is skipped when `continue_on_error` is set; otherwise
    /// the first failure aborts the stage.
    pub async fn enrich(
        &self,
        records: Vec<Record>,
        ctx: &StageContext,
        continue_on_error: bool,
    ) -> Result<EnrichOutput> {
        let mut output = EnrichOutput {
            records: Vec::with_capacity(records.len()),
            ..Default::default()
        };
        for record in records {
            let id = record.id.clone();
            match self.enrich_one(record, ctx, &mut output.attempts).await {
                Ok(record) => output.records.push(record),
                Err(e) if continue_on_error => {
                    tracing::warn!(record = %id, error = %e, "skipping record");
                    output
                        .failures
                        .push(FailureDetail::from_error(&e).at("enrich").for_record(id));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(output)
    }

    async fn enrich_one(&self, mut record: Record, ctx: &StageContext, attempts: &mut u32) -> Result<Record> {
        for enricher in &self.enrichers {
            record = match enricher {
                Enricher::Lookup(lookup) => lookup.apply(record)?,
                Enricher::Http(http) => http.apply(record, ctx, attempts).await?,
                Enricher::Metadata(values) => stamp_metadata(record, ctx, values),
            };
        }
        Ok(record)
    }
}

// =============================================================================
// Lookup
// =============================================================================

struct LookupEnricher {
    key_field: String,
    index: HashMap<String, Map<String, Value>>,
    columns: Vec<String>,
    prefix: String,
    on_miss: OnMiss,
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn index_table(table: &[Map<String, Value>], lookup_key: &str) -> HashMap<String, Map<String, Value>> {
    table
        .iter()
        .filter_map(|row| row.get(lookup_key).and_then(key_of).map(|k| (k, row.clone())))
        .collect()
}

fn lookup_columns(table: &[Map<String, Value>], lookup_key: &str, fields: &[String]) -> Vec<String> {
    if !fields.is_empty() {
        return fields.to_vec();
    }
    let mut columns: Vec<String> = table
        .iter()
        .flat_map(|row| row.keys())
        .filter(|k| *k != lookup_key)
        .cloned()
        .collect();
    columns.sort();
    columns.dedup();
    columns
}

impl LookupEnricher {
    fn apply(&self, record: Record) -> Result<Record> {
        let key = record.get(&self.key_field).and_then(key_of);
        let row = key.as_ref().and_then(|k| self.index.get(k));
        let mut data = record.data.clone();
        match (row, self.on_miss) {
            (Some(row), _) => {
                for column in &self.columns {
                    let value = row.get(column).cloned().unwrap_or(Value::Null);
                    data.insert(format!("{}{}", self.prefix, column), value);
                }
            }
            (None, OnMiss::Keep) => return Ok(record),
            (None, OnMiss::Null) => {
                for column in &self.columns {
                    data.insert(format!("{}{}", self.prefix, column), Value::Null);
                }
            }
            (None, OnMiss::Fail) => {
                return Err(Error::EnrichError {
                    enricher: "lookup".to_string(),
                    message: format!(
                        "no row for {} = {}",
                        self.key_field,
                        key.unwrap_or_else(|| "null".to_string())
                    ),
                });
            }
        }
        Ok(record.revise(data))
    }
}

// =============================================================================
// HTTP
// =============================================================================

struct HttpEnricher {
    templates: Environment<'static>,
    method: Method,
    headers: HeaderMap,
    target_field: String,
    data_path: Option<String>,
    on_miss: OnMiss,
}

fn url_template(url: &str) -> Result<Environment<'static>> {
    let mut templates = Environment::new();
    templates.add_template_owned(URL_TEMPLATE, url.to_string())?;
    Ok(templates)
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::config(format!("http enricher: invalid header '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::config(format!("http enricher: invalid value for '{name}'")))?;
        map.insert(header, value);
    }
    Ok(map)
}

impl HttpEnricher {
    async fn apply(&self, record: Record, ctx: &StageContext, attempts: &mut u32) -> Result<Record> {
        let url = self.templates.get_template(URL_TEMPLATE)?.render(&record.data)?;
        let target = origin_target(&url)?;
        let attempted = ctx
            .resilience
            .execute(&ctx.scope, &target, || self.fetch(&ctx.http, &url, &target))
            .await?;
        *attempts += attempted.attempts;

        let value = match attempted.value {
            Some(body) => match &self.data_path {
                Some(path) => lookup_path(&body, path).cloned().unwrap_or(Value::Null),
                None => body,
            },
            None => match self.on_miss {
                OnMiss::Keep => return Ok(record),
                OnMiss::Null => Value::Null,
                OnMiss::Fail => {
                    return Err(Error::EnrichError {
                        enricher: "http".to_string(),
                        message: format!("{url} not found"),
                    });
                }
            },
        };
        let mut data = record.data.clone();
        data.insert(self.target_field.clone(), value);
        Ok(record.revise(data))
    }

    /// `None` on 404
    async fn fetch(&self, client: &reqwest::Client, url: &str, target: &str) -> Result<Option<Value>> {
        let response = client
            .request(self.method.clone(), url)
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Remote {
                target: target.to_string(),
                status: status.as_u16(),
                message: body.chars().take(512).collect(),
            });
        }
        Ok(Some(response.json().await?))
    }
}

/// Breaker identity of an enrichment call
fn origin_target(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::config(format!("http enricher: invalid url '{url}': {e}")))?;
    Ok(format!("http:{}", parsed.origin().ascii_serialization()))
}

// =============================================================================
// Metadata
// =============================================================================

fn stamp_metadata(record: Record, ctx: &StageContext, values: &BTreeMap<String, String>) -> Record {
    let mut next = record.revise(record.data.clone());
    let metadata = &mut next.metadata;
    metadata.insert("runId".to_string(), ctx.scope.run_id.clone());
    metadata.insert("sourceId".to_string(), record.source_id.clone());
    metadata.insert("extractedAt".to_string(), record.created_at.to_rfc3339());
    metadata.insert("enrichedAt".to_string(), Utc::now().to_rfc3339());
    for (key, value) in values {
        metadata.insert(key.clone(), value.clone());
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitBreakerRegistry, Resilience};
    use crate::telemetry::{EventScope, NoopSink};
    use conflux_core::config::ResilienceSettings;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> StageContext {
        let settings = ResilienceSettings {
            max_attempts: 1,
            timeout_ms: 2000,
            ..Default::default()
        };
        StageContext::detached(
            EventScope::run("run-7"),
            Resilience::new(settings, CircuitBreakerRegistry::new(), Arc::new(NoopSink)),
        )
    }

    fn config(yaml: &str) -> EnrichmentConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    const LOOKUP: &str = r#"
enrichers:
  - type: lookup
    keyField: cc
    lookupKey: code
    table:
      - { code: DE, country: Germany, eu: true }
      - { code: US, country: United States, eu: false }
    prefix: geo_
"#;

    #[tokio::test]
    async fn test_lookup_copies_columns_with_prefix() {
        let stage = Enrichment::new(&config(LOOKUP)).unwrap();
        let out = stage
            .enrich(vec![Record::from_value("s", json!({"cc": "DE"}))], &ctx(), false)
            .await
            .unwrap();
        let record = &out.records[0];
        assert_eq!(record.get("geo_country"), Some(&json!("Germany")));
        assert_eq!(record.get("geo_eu"), Some(&json!(true)));
        assert!(record.get("geo_code").is_none());
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_lookup_miss_policies() {
        let keep = Enrichment::new(&config(LOOKUP)).unwrap();
        let out = keep
            .enrich(vec![Record::from_value("s", json!({"cc": "FR"}))], &ctx(), false)
            .await
            .unwrap();
        assert_eq!(out.records[0].version, 1);

        let fail = Enrichment::new(&config(&format!("{LOOKUP}    onMiss: fail\n"))).unwrap();
        let err = fail
            .enrich(vec![Record::from_value("s", json!({"cc": "FR"}))], &ctx(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EnrichError { .. }));

        let out = fail
            .enrich(
                vec![
                    Record::from_value("s", json!({"cc": "FR"})),
                    Record::from_value("s", json!({"cc": "US"})),
                ],
                &ctx(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_null_on_miss() {
        let stage = Enrichment::new(&config(
            r#"
enrichers:
  - type: lookup
    keyField: cc
    lookupKey: code
    table: [{ code: DE, country: Germany }]
    fields: [country]
    onMiss: "null"
"#,
        ))
        .unwrap();
        let out = stage
            .enrich(vec![Record::from_value("s", json!({"cc": 3}))], &ctx(), false)
            .await
            .unwrap();
        assert_eq!(out.records[0].get("country"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_metadata_stamps_run() {
        let stage = Enrichment::new(&config(
            "enrichers:\n  - type: metadata\n    values:\n      pipeline: nightly\n",
        ))
        .unwrap();
        let out = stage
            .enrich(vec![Record::from_value("orders", json!({"a": 1}))], &ctx(), false)
            .await
            .unwrap();
        let metadata = &out.records[0].metadata;
        assert_eq!(metadata.get("runId").map(String::as_str), Some("run-7"));
        assert_eq!(metadata.get("sourceId").map(String::as_str), Some("orders"));
        assert_eq!(metadata.get("pipeline").map(String::as_str), Some("nightly"));
        assert!(metadata.contains_key("enrichedAt"));
    }

    #[tokio::test]
    async fn test_http_unreachable_is_reported() {
        let stage = Enrichment::new(&config(
            r#"
enrichers:
  - type: http
    url: "http://127.0.0.1:9/customers/{{ id }}"
    targetField: customer
"#,
        ))
        .unwrap();
        let out = stage
            .enrich(vec![Record::from_value("s", json!({"id": 1}))], &ctx(), true)
            .await
            .unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.attempts, 0);
    }

    #[test]
    fn test_invalid_http_config() {
        let bad_template = config(
            "enrichers:\n  - type: http\n    url: \"http://x/{{ id \"\n    targetField: c\n",
        );
        assert!(Enrichment::new(&bad_template).is_err());

        let bad_method = config(
            "enrichers:\n  - type: http\n    url: http://x\n    method: \"GE T\"\n    targetField: c\n",
        );
        assert!(matches!(
            Enrichment::new(&bad_method),
            Err(Error::Configuration { .. })
        ));
    }

    #[test]
    fn test_origin_target() {
        assert_eq!(
            origin_target("https://crm.example.com:8443/c/1?x=2").unwrap(),
            "http:https://crm.example.com:8443"
        );
        assert!(origin_target("not a url").is_err());
    }
}
