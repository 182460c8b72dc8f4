//! Blob persistence: store the raw upload before anything else touches it.
//!
//! The image is written first so that every later stage (and every stored
//! row) refers to an object that already exists. A row is never appended for
//! a locator whose write did not succeed.
//!
//! ## Locators
//!
//! Locators are `{millis}_{filename}`. Millisecond timestamps alone collide
//! when two uploads with the same name land in the same millisecond, so
//! [`LocatorIssuer`] remembers the last millisecond it handed out and bumps
//! to `last + 1` when the clock has not moved past it. Locators are therefore
//! strictly increasing within one process; two processes sharing a bucket can
//! still collide, which [`LocalBlobStore`] detects (no-clobber rename) and
//! GCS does not.

use crate::error::IngestError;
use crate::output::BlobLocator;
use async_trait::async_trait;
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Capability: durable object storage for uploaded images.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs, e.g. `"gcs"`.
    fn name(&self) -> &'static str;

    /// Write one object. Must not silently succeed on a rejected write.
    async fn put(
        &self,
        locator: &BlobLocator,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), IngestError>;

    /// Read an object back (used by recognizers that need the pixels).
    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, IngestError>;

    /// A URI an external OCR service can read directly, if the backend has one.
    fn uri(&self, locator: &BlobLocator) -> Option<String> {
        let _ = locator;
        None
    }
}

// ── Locator issuance ─────────────────────────────────────────────────────

/// Issues strictly increasing `{millis}_{filename}` locators.
#[derive(Debug, Default)]
pub struct LocatorIssuer {
    last_ms: AtomicU64,
}

impl LocatorIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a locator stamped with the current wall clock.
    pub fn issue(&self, declared_name: &str) -> BlobLocator {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.issue_at(now, declared_name)
    }

    /// Issue a locator for a given clock reading.
    ///
    /// A reading at or before the last issued millisecond is bumped to
    /// `last + 1`, so a backwards clock step cannot produce a duplicate.
    pub fn issue_at(&self, now_ms: u64, declared_name: &str) -> BlobLocator {
        let prev = self
            .last_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let stamp = now_ms.max(prev + 1);
        BlobLocator::new(format!("{}_{}", stamp, sanitize_filename(declared_name)))
    }
}

/// Reduce a client-declared name to a safe final path component.
///
/// Directory parts (either separator) are stripped, control characters are
/// replaced with `_`, and an empty or dot-only name becomes `upload`.
pub fn sanitize_filename(declared: &str) -> String {
    let base = declared
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "upload".to_string()
    } else {
        cleaned
    }
}

// ── Persister ────────────────────────────────────────────────────────────

/// The persist stage: issue a locator, then write the object.
pub struct BlobPersister {
    store: Arc<dyn BlobStore>,
    issuer: LocatorIssuer,
}

impl BlobPersister {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            issuer: LocatorIssuer::new(),
        }
    }

    /// Persist one upload and return its locator.
    pub async fn persist(
        &self,
        payload: &[u8],
        declared_name: &str,
        content_type: &str,
    ) -> Result<BlobLocator, IngestError> {
        let locator = self.issuer.issue(declared_name);
        self.store.put(&locator, payload, content_type).await?;
        info!(
            "Stored {} ({} bytes, {}) in {}",
            locator,
            payload.len(),
            content_type,
            self.store.name()
        );
        Ok(locator)
    }
}

// ── Local filesystem store ───────────────────────────────────────────────

/// Stores uploads as files in one directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Open (and create if needed) the storage directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, IngestError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            IngestError::InvalidConfig(format!(
                "Cannot create storage directory '{}': {e}",
                root.display()
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &BlobLocator) -> PathBuf {
        self.root.join(locator.as_str())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &'static str {
        "local"
    }

    /// Atomic write: temp file in the same directory, then a no-clobber
    /// rename so an existing object is never overwritten.
    async fn put(
        &self,
        locator: &BlobLocator,
        payload: &[u8],
        _content_type: &str,
    ) -> Result<(), IngestError> {
        let root = self.root.clone();
        let target = self.path_for(locator);
        let payload = payload.to_vec();
        let fail = |reason: String| IngestError::StorageFailure {
            locator: locator.to_string(),
            reason,
        };

        tokio::task::spawn_blocking(move || -> Result<(), String> {
            let mut tmp = tempfile::NamedTempFile::new_in(&root).map_err(|e| e.to_string())?;
            tmp.write_all(&payload).map_err(|e| e.to_string())?;
            tmp.as_file().sync_all().map_err(|e| e.to_string())?;
            tmp.persist_noclobber(&target)
                .map_err(|e| e.error.to_string())?;
            Ok(())
        })
        .await
        .map_err(|e| fail(format!("write task failed: {e}")))?
        .map_err(fail)?;

        debug!("Wrote {}", self.path_for(locator).display());
        Ok(())
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, IngestError> {
        tokio::fs::read(self.path_for(locator))
            .await
            .map_err(|e| IngestError::StorageFailure {
                locator: locator.to_string(),
                reason: format!("read failed: {e}"),
            })
    }
}

// ── Google Cloud Storage ─────────────────────────────────────────────────

/// Settings for [`GcsBlobStore`].
#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub bucket: String,
    /// OAuth2 bearer token with `devstorage.read_write` scope.
    pub access_token: Option<String>,
    /// API base URL. Default: `https://storage.googleapis.com`.
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl GcsConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            access_token: None,
            endpoint: "https://storage.googleapis.com".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Stores uploads as objects in a GCS bucket (simple, non-resumable upload).
pub struct GcsBlobStore {
    client: reqwest::Client,
    config: GcsConfig,
}

impl GcsBlobStore {
    pub fn new(config: GcsConfig) -> Result<Self, IngestError> {
        if config.bucket.trim().is_empty() {
            return Err(IngestError::InvalidConfig("GCS bucket name is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn base(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn object_url(&self, locator: &BlobLocator) -> Result<reqwest::Url, IngestError> {
        let mut url = reqwest::Url::parse(self.base())
            .map_err(|e| IngestError::InvalidConfig(format!("GCS endpoint: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| IngestError::InvalidConfig("GCS endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend([
                "storage",
                "v1",
                "b",
                self.config.bucket.as_str(),
                "o",
                locator.as_str(),
            ]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    fn name(&self) -> &'static str {
        "gcs"
    }

    async fn put(
        &self,
        locator: &BlobLocator,
        payload: &[u8],
        content_type: &str,
    ) -> Result<(), IngestError> {
        let fail = |reason: String| IngestError::StorageFailure {
            locator: locator.to_string(),
            reason,
        };
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base(),
            self.config.bucket
        );
        let request = self
            .client
            .post(&url)
            .query(&[("uploadType", "media"), ("name", locator.as_str())])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(payload.to_vec());

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fail(format!("HTTP {status}: {}", excerpt(&body))));
        }
        Ok(())
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, IngestError> {
        let fail = |reason: String| IngestError::StorageFailure {
            locator: locator.to_string(),
            reason,
        };
        let url = self.object_url(locator)?;
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {status} reading object")));
        }
        let bytes = response.bytes().await.map_err(|e| fail(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn uri(&self, locator: &BlobLocator) -> Option<String> {
        Some(format!("gs://{}/{}", self.config.bucket, locator))
    }
}

/// First 200 characters of an upstream error body.
pub(crate) fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > 200 {
        let cut: String = trimmed.chars().take(199).collect();
        format!("{cut}\u{2026}")
    } else {
        trimmed.to_string()
    }
}
