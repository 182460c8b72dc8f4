//! In-memory stand-ins for the four pipeline capabilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bizcard_ingest::pipeline::extract::CompletionClient;
use bizcard_ingest::pipeline::persist::BlobStore;
use bizcard_ingest::pipeline::recognize::TextRecognizer;
use bizcard_ingest::pipeline::sink::RecordSink;
use bizcard_ingest::{
    BlobLocator, IngestConfig, IngestError, IngestObserver, Ingestor, PipelineState,
    RecognizedText, SinkAck, StructuredRecord,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// A tiny but valid PNG signature followed by padding.
pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR-padding";

#[derive(Default)]
pub struct MemoryStore {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
    pub fail: bool,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        locator: &BlobLocator,
        payload: &[u8],
        _content_type: &str,
    ) -> Result<(), IngestError> {
        if self.fail {
            return Err(IngestError::StorageFailure {
                locator: locator.to_string(),
                reason: "bucket unavailable".into(),
            });
        }
        self.blobs
            .lock()
            .unwrap()
            .insert(locator.to_string(), payload.to_vec());
        Ok(())
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, IngestError> {
        self.blobs
            .lock()
            .unwrap()
            .get(locator.as_str())
            .cloned()
            .ok_or_else(|| IngestError::StorageFailure {
                locator: locator.to_string(),
                reason: "not found".into(),
            })
    }
}

/// Returns the same text for every image, or fails.
pub struct StubRecognizer {
    text: Option<String>,
    pub calls: AtomicUsize,
}

impl StubRecognizer {
    pub fn returning(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            text: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextRecognizer for StubRecognizer {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn recognize(&self, locator: &BlobLocator) -> Result<RecognizedText, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.text {
            Some(text) => Ok(RecognizedText::new(text.clone())),
            None => Err(IngestError::RecognitionFailure {
                locator: locator.to_string(),
                reason: "quota exceeded".into(),
            }),
        }
    }
}

/// Answers every completion with a fixed string, or fails.
pub struct StubCompletion {
    reply: Option<String>,
    pub calls: AtomicUsize,
    pub last_user: Mutex<Option<String>>,
}

impl StubCompletion {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: AtomicUsize::new(0),
            last_user: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            calls: AtomicUsize::new(0),
            last_user: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for StubCompletion {
    async fn complete(&self, _system: &str, user: &str) -> Result<String, IngestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_user.lock().unwrap() = Some(user.to_string());
        self.reply
            .clone()
            .ok_or_else(|| IngestError::ExtractionFailure {
                reason: "connection reset".into(),
            })
    }
}

/// Collects appended rows, or rejects them with a status.
#[derive(Default)]
pub struct MemorySink {
    pub rows: Mutex<Vec<StructuredRecord>>,
    pub reject_with: Option<u16>,
}

impl MemorySink {
    pub fn rejecting(status: u16) -> Self {
        Self {
            reject_with: Some(status),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, record: &StructuredRecord) -> Result<SinkAck, IngestError> {
        if let Some(status) = self.reject_with {
            return Err(IngestError::SinkFailure {
                status: Some(status),
                reason: "sheet is read-only".into(),
            });
        }
        self.rows.lock().unwrap().push(record.clone());
        Ok(SinkAck {
            status: Some(201),
            rows: 1,
        })
    }
}

/// Records every state a run entered.
#[derive(Default)]
pub struct RecordingObserver {
    pub states: Mutex<Vec<PipelineState>>,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<PipelineState> {
        self.states.lock().unwrap().clone()
    }
}

impl IngestObserver for RecordingObserver {
    fn on_transition(&self, _job: &str, _from: &PipelineState, to: &PipelineState) {
        self.states.lock().unwrap().push(to.clone());
    }
}

/// Route library logs to the test harness; `RUST_LOG=debug` shows transitions.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One pipeline wired to stubs, with handles to inspect each stub.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub recognizer: Arc<StubRecognizer>,
    pub completion: Arc<StubCompletion>,
    pub sink: Arc<MemorySink>,
    pub observer: Arc<RecordingObserver>,
    pub ingestor: Ingestor,
}

impl Harness {
    pub fn new(
        store: MemoryStore,
        recognizer: StubRecognizer,
        completion: StubCompletion,
        sink: MemorySink,
    ) -> Self {
        Self::with_config(IngestConfig::default(), store, recognizer, completion, sink)
    }

    pub fn with_config(
        config: IngestConfig,
        store: MemoryStore,
        recognizer: StubRecognizer,
        completion: StubCompletion,
        sink: MemorySink,
    ) -> Self {
        init_tracing();
        let store = Arc::new(store);
        let recognizer = Arc::new(recognizer);
        let completion = Arc::new(completion);
        let sink = Arc::new(sink);
        let observer = Arc::new(RecordingObserver::default());
        let ingestor = Ingestor::new(
            Arc::new(config),
            store.clone(),
            recognizer.clone(),
            completion.clone(),
            sink.clone(),
        )
        .with_observer(observer.clone());
        Self {
            store,
            recognizer,
            completion,
            sink,
            observer,
            ingestor,
        }
    }

    /// All stages succeed; OCR and completion answer with the given strings.
    pub fn happy(text: &str, reply: &str) -> Self {
        Self::new(
            MemoryStore::default(),
            StubRecognizer::returning(text),
            StubCompletion::replying(reply),
            MemorySink::default(),
        )
    }
}
