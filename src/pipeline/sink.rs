//! Record sink: append one normalized row to the tabular store.
//!
//! There is no idempotency key. A client that resubmits after a sink
//! failure can produce a duplicate row if the first append actually landed;
//! deduplication is a decision for the store's owner, not the pipeline.

use crate::error::IngestError;
use crate::output::{SinkAck, StructuredRecord};
use crate::pipeline::persist::excerpt;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Capability: append rows to an external table.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Short backend name for logs, e.g. `"http"`.
    fn name(&self) -> &'static str;

    async fn append(&self, record: &StructuredRecord) -> Result<SinkAck, IngestError>;
}

fn row_of(record: &StructuredRecord) -> Result<serde_json::Map<String, Value>, IngestError> {
    record
        .to_row()
        .map_err(|e| IngestError::Internal(format!("cannot encode row: {e}")))
}

// ── HTTP (spreadsheet API) ───────────────────────────────────────────────

/// Credentials for [`HttpRecordSink`].
#[derive(Clone, Default)]
pub enum SinkAuth {
    #[default]
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for SinkAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkAuth::None => f.write_str("None"),
            SinkAuth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            SinkAuth::Basic { username, .. } => write!(f, "Basic({username}, <redacted>)"),
        }
    }
}

/// Settings for [`HttpRecordSink`].
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Endpoint accepting `POST {"data": [row, …]}`, e.g. a SheetDB API URL.
    pub url: String,
    pub auth: SinkAuth,
    pub timeout_secs: u64,
}

impl HttpSinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: SinkAuth::None,
            timeout_secs: 30,
        }
    }
}

/// Appends rows by POSTing them to a spreadsheet-style REST API.
pub struct HttpRecordSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
}

impl HttpRecordSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, IngestError> {
        reqwest::Url::parse(&config.url)
            .map_err(|e| IngestError::InvalidConfig(format!("Sink URL '{}': {e}", config.url)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl RecordSink for HttpRecordSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn append(&self, record: &StructuredRecord) -> Result<SinkAck, IngestError> {
        let body = json!({ "data": [row_of(record)?] });
        let mut request = self.client.post(&self.config.url).json(&body);
        request = match &self.config.auth {
            SinkAuth::None => request,
            SinkAuth::Bearer(token) => request.bearer_auth(token),
            SinkAuth::Basic { username, password } => request.basic_auth(username, Some(password)),
        };

        let response = request.send().await.map_err(|e| IngestError::SinkFailure {
            status: e.status().map(|s| s.as_u16()),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(IngestError::SinkFailure {
                status: Some(status.as_u16()),
                reason: excerpt(&text),
            });
        }

        // SheetDB answers {"created": n}; other APIs may answer anything.
        let rows = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("created").and_then(Value::as_u64))
            .map(|n| n as usize)
            .unwrap_or(1);
        debug!("Sink answered HTTP {} ({} row(s))", status, rows);
        Ok(SinkAck {
            status: Some(status.as_u16()),
            rows,
        })
    }
}

// ── JSON Lines file ──────────────────────────────────────────────────────

/// Appends rows as JSON Lines to a local file.
///
/// Writes are serialised through a mutex so concurrent requests never
/// interleave partial lines.
pub struct JsonlRecordSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlRecordSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonlRecordSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, record: &StructuredRecord) -> Result<SinkAck, IngestError> {
        let fail = |reason: String| IngestError::SinkFailure {
            status: None,
            reason,
        };
        let mut line = serde_json::to_string(&row_of(record)?)
            .map_err(|e| IngestError::Internal(format!("cannot encode row: {e}")))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| fail(format!("{}: {e}", parent.display())))?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| fail(format!("{}: {e}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| fail(e.to_string()))?;
        file.flush().await.map_err(|e| fail(e.to_string()))?;

        info!("Appended row for {} to {}", record.raw.file, self.path.display());
        Ok(SinkAck {
            status: None,
            rows: 1,
        })
    }
}
