//! Local file system connector (`FileSystem` / `local`)
//!
//! ```yaml
//! type: FileSystem
//! connectionProperties:
//!   path: ./data/orders      # a file, or a directory read file by file
//!   format: jsonl            # jsonl | json | csv, inferred from the extension
//!   writeMode: append        # append | overwrite
//!   delimiter: ","           # csv only
//! ```
//!
//! File access runs on tokio's blocking pool; reads list the files first and
//! then parse them one at a time.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Connection, ConnectorRole, ConnectorSpec, ReadQuery, RecordStream, WriteCounts};
use crate::condition::{FilterCondition, FilterOperator};
use crate::connectors::Connector;
use crate::definitions::ConnectorKind;
use crate::error::{Error, Result};
use crate::record::Record;

/// Provider name
pub const PROVIDER: &str = "local";

/// On-disk record encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// One JSON object per line
    JsonLines,
    /// A JSON array (or a single object)
    Json,
    /// Comma separated values with a header row
    Csv,
}

impl FileFormat {
    fn parse(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            other => Err(Error::config(format!("unknown file format '{other}'"))),
        }
    }

    fn from_extension(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| Self::parse(ext).ok())
    }
}

/// How writes treat existing content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep existing content
    Append,
    /// Truncate when the connection opens
    Overwrite,
}

/// Reads and writes local files
#[derive(Debug)]
pub struct FileConnector {
    spec: ConnectorSpec,
    settings: FileSettings,
    target: String,
}

#[derive(Debug, Clone)]
struct FileSettings {
    path: PathBuf,
    format: Option<FileFormat>,
    write_mode: WriteMode,
    delimiter: u8,
}

impl FileConnector {
    /// Build from a spec; `path` is required
    pub fn new(spec: ConnectorSpec) -> Result<Self> {
        let path = spec.resolve_path(spec.require("path")?);
        let format = spec.property("format").map(FileFormat::parse).transpose()?;
        let write_mode = match spec.property("writeMode").unwrap_or("append") {
            "append" => WriteMode::Append,
            "overwrite" => WriteMode::Overwrite,
            other => {
                return Err(Error::config(format!(
                    "connector '{}': unknown writeMode '{}'",
                    spec.id, other
                )));
            }
        };
        let delimiter = match spec.property("delimiter") {
            None => b',',
            Some(d) if d.len() == 1 => d.as_bytes()[0],
            Some(d) => {
                return Err(Error::config(format!(
                    "connector '{}': delimiter must be a single byte, got '{}'",
                    spec.id, d
                )));
            }
        };
        let target = spec.target(PROVIDER, &path.display().to_string());
        Ok(Self {
            spec,
            settings: FileSettings {
                path,
                format,
                write_mode,
                delimiter,
            },
            target,
        })
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::FileSystem
    }

    fn provider(&self) -> &str {
        PROVIDER
    }

    fn target(&self) -> &str {
        &self.target
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let path = &self.settings.path;
        match self.spec.role {
            ConnectorRole::Source => {
                // surfaces NotFound, which is not retried
                tokio::fs::metadata(path).await?;
            }
            ConnectorRole::Destination => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                if self.settings.write_mode == WriteMode::Overwrite {
                    tokio::fs::File::create(path).await?;
                }
            }
        }
        Ok(Box::new(FileConnection {
            files: Arc::new(FileAccess {
                settings: self.settings.clone(),
                source_id: self.spec.id.clone(),
                schema_id: self.spec.schema_id.clone(),
            }),
            base_path: self.spec.base_path.clone(),
        }))
    }
}

struct FileConnection {
    files: Arc<FileAccess>,
    base_path: Option<PathBuf>,
}

/// Synchronous file work, run through [`blocking`]
struct FileAccess {
    settings: FileSettings,
    source_id: String,
    schema_id: Option<String>,
}

/// Run `work` on the blocking pool
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

impl FileAccess {
    fn format_of(&self, path: &Path) -> FileFormat {
        self.settings
            .format
            .or_else(|| FileFormat::from_extension(path))
            .unwrap_or(FileFormat::JsonLines)
    }

    fn files(&self, root: &Path) -> Result<Vec<PathBuf>> {
        if !root.is_dir() {
            return Ok(vec![root.to_path_buf()]);
        }
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let format = FileFormat::from_extension(entry.path());
            let wanted = match self.settings.format {
                Some(declared) => format == Some(declared),
                None => format.is_some(),
            };
            if wanted {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    fn record(&self, path: &Path, position: usize, data: Map<String, Value>) -> Record {
        let record = Record::new(&self.source_id, data)
            .with_metadata("file", path.display().to_string())
            .with_metadata("position", position.to_string());
        match &self.schema_id {
            Some(schema) => record.with_schema(schema),
            None => record,
        }
    }

    /// Records of one file, ending at the first error
    fn read_file(&self, path: &Path) -> Vec<Result<Record>> {
        match self.format_of(path) {
            FileFormat::JsonLines => self.read_json_lines(path),
            FileFormat::Json => self.read_json(path),
            FileFormat::Csv => self.read_csv(path),
        }
    }

    fn read_json_lines(&self, path: &Path) -> Vec<Result<Record>> {
        let file = match std::fs::File::open(path) {
            Ok(f) => f,
            Err(e) => return vec![Err(e.into())],
        };
        let mut out = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let parsed = line
                .map_err(Error::from)
                .and_then(|l| match l.trim() {
                    "" => Ok(None),
                    trimmed => Ok(Some(serde_json::from_str::<Value>(trimmed)?)),
                });
            match parsed {
                Ok(None) => continue,
                Ok(Some(value)) => out.push(Ok(self.record(path, index + 1, into_object(value)))),
                Err(e) => {
                    out.push(Err(e));
                    break;
                }
            }
        }
        out
    }

    fn read_json(&self, path: &Path) -> Vec<Result<Record>> {
        let parsed = std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|contents| Ok(serde_json::from_str::<Value>(&contents)?));
        match parsed {
            Ok(value) => super::records_at_path(value, None)
                .into_iter()
                .enumerate()
                .map(|(i, v)| Ok(self.record(path, i + 1, into_object(v))))
                .collect(),
            Err(e) => vec![Err(e)],
        }
    }

    fn read_csv(&self, path: &Path) -> Vec<Result<Record>> {
        let mut reader = match csv::ReaderBuilder::new()
            .delimiter(self.settings.delimiter)
            .from_path(path)
        {
            Ok(r) => r,
            Err(e) => return vec![Err(e.into())],
        };
        let headers = match reader.headers() {
            Ok(h) => h.clone(),
            Err(e) => return vec![Err(e.into())],
        };
        let mut out = Vec::new();
        for (index, row) in reader.records().enumerate() {
            match row {
                Ok(row) => {
                    let data = headers
                        .iter()
                        .zip(row.iter())
                        .map(|(h, v)| (h.to_string(), Value::String(v.to_string())))
                        .collect();
                    out.push(Ok(self.record(path, index + 1, data)));
                }
                Err(e) => {
                    out.push(Err(e.into()));
                    break;
                }
            }
        }
        out
    }

    fn write(&self, records: &[Record]) -> Result<()> {
        match self.format_of(&self.settings.path) {
            FileFormat::JsonLines => self.write_json_lines(records),
            FileFormat::Json => self.write_json(records),
            FileFormat::Csv => self.write_csv(records),
        }
    }

    fn write_json_lines(&self, records: &[Record]) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.settings.path)?;
        let mut writer = BufWriter::new(file);
        for record in records {
            writeln!(writer, "{}", serde_json::to_string(&record.data)?)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_json(&self, records: &[Record]) -> Result<()> {
        let path = &self.settings.path;
        let mut items = match std::fs::read_to_string(path) {
            Ok(existing) if !existing.trim().is_empty() => {
                super::records_at_path(serde_json::from_str(&existing)?, None)
            }
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        items.extend(records.iter().map(Record::to_value));
        std::fs::write(path, serde_json::to_string_pretty(&Value::Array(items))?)?;
        Ok(())
    }

    fn write_csv(&self, records: &[Record]) -> Result<()> {
        let path = &self.settings.path;
        let existing_headers = match std::fs::metadata(path) {
            Ok(meta) if meta.len() > 0 => Some(
                csv::ReaderBuilder::new()
                    .delimiter(self.settings.delimiter)
                    .from_path(path)?
                    .headers()?
                    .iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };
        let headers = match &existing_headers {
            Some(h) => h.clone(),
            None => {
                let mut headers: Vec<String> = Vec::new();
                for record in records {
                    for key in record.data.keys() {
                        if !headers.contains(key) {
                            headers.push(key.clone());
                        }
                    }
                }
                headers
            }
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.settings.delimiter)
            .from_writer(file);
        if existing_headers.is_none() {
            writer.write_record(&headers)?;
        }
        for record in records {
            writer.write_record(headers.iter().map(|h| match record.get(h) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }))?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[async_trait]
impl Connection for FileConnection {
    fn read<'a>(&'a self, query: Option<&'a ReadQuery>) -> RecordStream<'a> {
        let root = match query.and_then(|q| q.statement.as_deref()) {
            Some(path) => match &self.base_path {
                Some(base) if Path::new(path).is_relative() => base.join(path),
                _ => PathBuf::from(path),
            },
            None => self.files.settings.path.clone(),
        };
        let listing = {
            let files = self.files.clone();
            blocking(move || files.files(&root))
        };
        let files = self.files.clone();
        let watermark = query.and_then(|q| q.watermark.as_ref()).map(|w| {
            FilterCondition::new(
                w.column.clone(),
                FilterOperator::GreaterThan,
                Value::String(w.value.clone()),
            )
        });
        stream::once(listing)
            .flat_map(|listed| {
                let paths: Vec<Result<PathBuf>> = match listed {
                    Ok(paths) => paths.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(paths)
            })
            .then(move |path| {
                let files = files.clone();
                async move {
                    let parsed = match path {
                        Ok(path) => blocking(move || Ok(files.read_file(&path))).await,
                        Err(e) => Err(e),
                    };
                    parsed.unwrap_or_else(|e| vec![Err(e)])
                }
            })
            .flat_map(stream::iter)
            .filter(move |item| {
                let keep = match (item, &watermark) {
                    (Ok(record), Some(condition)) => condition.evaluate(&record.to_value()),
                    _ => true,
                };
                futures::future::ready(keep)
            })
            .boxed()
    }

    async fn write(&self, records: &[Record]) -> Result<WriteCounts> {
        if records.is_empty() {
            return Ok(WriteCounts::default());
        }
        let files = self.files.clone();
        let batch = records.to_vec();
        blocking(move || files.write(&batch)).await?;
        tracing::debug!(
            path = %self.files.settings.path.display(),
            count = records.len(),
            "wrote records"
        );
        Ok(WriteCounts {
            written: records.len(),
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Watermark;
    use crate::definitions::{DestinationDefinition, DestinationType, SourceDefinition};
    use futures::TryStreamExt;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn source_spec(path: &Path, extra: &[(&str, &str)]) -> ConnectorSpec {
        let mut props: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        props.insert("path".to_string(), path.display().to_string());
        let def: SourceDefinition = serde_json::from_value(json!({
            "id": "files",
            "name": "Files",
            "type": "FileSystem",
            "connectionProperties": props,
        }))
        .unwrap();
        ConnectorSpec::from_source(&def)
    }

    fn dest_spec(path: &Path, extra: &[(&str, &str)]) -> ConnectorSpec {
        let mut props: BTreeMap<String, String> = extra
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        props.insert("path".to_string(), path.display().to_string());
        ConnectorSpec::from_destination(&DestinationDefinition {
            id: "out".to_string(),
            name: "Out".to_string(),
            destination_type: DestinationType::FileSystem,
            connection_properties: props,
        })
    }

    async fn read_all(spec: ConnectorSpec, query: Option<&ReadQuery>) -> Result<Vec<Record>> {
        let connector = FileConnector::new(spec)?;
        let connection = connector.connect().await?;
        let records = connection.read(query).try_collect().await;
        connection.close().await?;
        records
    }

    fn record(value: Value) -> Record {
        Record::from_value("test", value)
    }

    #[tokio::test]
    async fn test_read_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n\n{\"id\": 2}\n").unwrap();

        let records = read_all(source_spec(&path, &[]), None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("id"), Some(&json!(2)));
        assert_eq!(records[0].source_id, "files");
        assert_eq!(records[1].metadata.get("position").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn test_read_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n{\"id\": 2}\n").unwrap();

        let connector = FileConnector::new(source_spec(&path, &[])).unwrap();
        let connection = connector.connect().await.unwrap();
        let first: Vec<Record> = connection.read(None).try_collect().await.unwrap();
        let second: Vec<Record> = connection.read(None).try_collect().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_file_work_leaves_the_runtime_free() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n{\"id\": 2}\n").unwrap();
        let connection = FileConnector::new(source_spec(&path, &[]))
            .unwrap()
            .connect()
            .await
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });
        let records: Vec<Record> = connection.read(None).try_collect().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(ran.load(Ordering::SeqCst));

        let out = dir.path().join("out.jsonl");
        let connection = FileConnector::new(dest_spec(&out, &[]))
            .unwrap()
            .connect()
            .await
            .unwrap();
        ran.store(false, Ordering::SeqCst);
        let flag = ran.clone();
        tokio::spawn(async move { flag.store(true, Ordering::SeqCst) });
        connection.write(&[record(json!({"a": 1}))]).await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bad_line_ends_stream_after_good_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"id\": 1}\n{oops\n{\"id\": 3}\n").unwrap();

        let connector = FileConnector::new(source_spec(&path, &[])).unwrap();
        let connection = connector.connect().await.unwrap();
        let items: Vec<Result<Record>> = connection.read(None).collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(Error::Json(_))));
    }

    #[tokio::test]
    async fn test_read_csv_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("people.csv");
        std::fs::write(&csv_path, "name,age\nAda,36\nAlan,41\n").unwrap();
        let records = read_all(source_spec(&csv_path, &[]), None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("age"), Some(&json!("36")));

        let json_path = dir.path().join("people.json");
        std::fs::write(&json_path, r#"[{"name": "Ada"}, {"name": "Alan"}]"#).unwrap();
        let records = read_all(source_spec(&json_path, &[]), None).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_read_directory_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jsonl"), "{\"n\": 2}\n").unwrap();
        std::fs::write(dir.path().join("a.jsonl"), "{\"n\": 1}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let records = read_all(source_spec(dir.path(), &[]), None).await.unwrap();
        let values: Vec<&Value> = records.iter().filter_map(|r| r.get("n")).collect();
        assert_eq!(values, vec![&json!(1), &json!(2)]);
    }

    #[tokio::test]
    async fn test_watermark_filters_old_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.jsonl");
        std::fs::write(&path, "{\"seq\": 1}\n{\"seq\": 2}\n{\"seq\": 3}\n").unwrap();
        let query = ReadQuery {
            watermark: Some(Watermark {
                column: "seq".to_string(),
                value: "1".to_string(),
            }),
            ..Default::default()
        };
        let records = read_all(source_spec(&path, &[]), Some(&query)).await.unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_source_file_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let connector = FileConnector::new(source_spec(&dir.path().join("nope.jsonl"), &[])).unwrap();
        let err = connector.connect().await.err().unwrap();
        assert!(!err.is_transient());
        assert!(!connector.test_connection().await);
    }

    #[tokio::test]
    async fn test_write_append_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/result.jsonl");

        let connector = FileConnector::new(dest_spec(&path, &[])).unwrap();
        let connection = connector.connect().await.unwrap();
        let counts = connection
            .write(&[record(json!({"a": 1})), record(json!({"a": 2}))])
            .await
            .unwrap();
        assert_eq!(counts.written, 2);
        connection.write(&[record(json!({"a": 3}))]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 3);

        let connector =
            FileConnector::new(dest_spec(&path, &[("writeMode", "overwrite")])).unwrap();
        let connection = connector.connect().await.unwrap();
        connection.write(&[record(json!({"a": 4}))]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), r#"{"a":4}"#);
    }

    #[tokio::test]
    async fn test_write_csv_keeps_existing_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let connector = FileConnector::new(dest_spec(&path, &[])).unwrap();
        let connection = connector.connect().await.unwrap();
        connection
            .write(&[record(json!({"name": "Ada", "age": 36}))])
            .await
            .unwrap();
        connection
            .write(&[record(json!({"age": 41, "name": "Alan"}))])
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "name,age\nAda,36\nAlan,41\n");
    }

    #[tokio::test]
    async fn test_write_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let connector = FileConnector::new(dest_spec(&path, &[])).unwrap();
        let connection = connector.connect().await.unwrap();
        connection.write(&[record(json!({"a": 1}))]).await.unwrap();
        connection.write(&[record(json!({"a": 2}))]).await.unwrap();
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value, json!([{"a": 1}, {"a": 2}]));
    }

    #[test]
    fn test_invalid_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.jsonl");
        assert!(FileConnector::new(dest_spec(&path, &[("writeMode", "replace")])).is_err());
        assert!(FileConnector::new(dest_spec(&path, &[("format", "parquet")])).is_err());
        assert!(FileConnector::new(dest_spec(&path, &[("delimiter", ";;")])).is_err());
    }
}
