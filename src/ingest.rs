//! Pipeline orchestration: one upload in, one stored row (or one error) out.
//!
//! [`Ingestor`] owns one adapter per stage and runs them strictly in order.
//! Each stage returns a `Result`; the orchestrator matches on it before
//! moving on, so the failing stage is always known and a failure can never
//! skip ahead. There are no retries: the first error moves the run to
//! [`PipelineState::Failed`] and is returned as-is.
//!
//! The ordering is also the durability guarantee: the sink is only reached
//! after the blob write has returned `Ok`, so no row ever points at an image
//! that was not stored.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::output::{IngestOutput, IngestStats, UploadJob};
use crate::pipeline::encode::{looks_like_image, resolve_content_type};
use crate::pipeline::extract::{CompletionClient, FieldExtractor};
use crate::pipeline::normalize::Normalizer;
use crate::pipeline::persist::{BlobPersister, BlobStore};
use crate::pipeline::recognize::TextRecognizer;
use crate::pipeline::sink::RecordSink;
use crate::progress::{IngestObserver, Observer, PipelineState};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// The ingestion pipeline, shared by every request.
///
/// Construct once at startup; all fields are read-only afterwards, so an
/// `Arc<Ingestor>` can serve any number of concurrent uploads.
pub struct Ingestor {
    config: Arc<IngestConfig>,
    persister: BlobPersister,
    recognizer: Arc<dyn TextRecognizer>,
    extractor: FieldExtractor,
    normalizer: Normalizer,
    sink: Arc<dyn RecordSink>,
    observer: Option<Observer>,
}

impl Ingestor {
    pub fn new(
        config: Arc<IngestConfig>,
        store: Arc<dyn BlobStore>,
        recognizer: Arc<dyn TextRecognizer>,
        completion: Arc<dyn CompletionClient>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let extractor = FieldExtractor::new(completion, &config);
        let normalizer = Normalizer::new(config.fields.clone(), config.unknown_fields);
        Self {
            persister: BlobPersister::new(store),
            recognizer,
            extractor,
            normalizer,
            sink,
            observer: None,
            config,
        }
    }

    /// Report every state transition to `observer`.
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Run one upload through every stage.
    ///
    /// # Errors
    /// The first stage failure, unchanged. Content problems in the
    /// completion are not errors; see [`IngestOutput::degraded`].
    pub async fn ingest(&self, job: UploadJob) -> Result<IngestOutput, IngestError> {
        let total_start = Instant::now();
        let mut run = Run::new(&job.filename, self.observer.as_deref());
        let mut stats = IngestStats::default();

        // ── Received: validate ───────────────────────────────────────────
        if job.payload.is_empty() {
            return Err(run.fail(IngestError::InvalidUpload(format!(
                "'{}' is empty",
                job.filename
            ))));
        }
        let content_type = resolve_content_type(&job.content_type, &job.payload);
        if !looks_like_image(&job.payload) {
            warn!(
                "'{}' ({}) does not look like an image; continuing",
                job.filename, content_type
            );
        }

        // ── Persist ──────────────────────────────────────────────────────
        run.advance();
        let t = Instant::now();
        let locator = match self
            .persister
            .persist(&job.payload, &job.filename, &content_type)
            .await
        {
            Ok(locator) => locator,
            Err(e) => return Err(run.fail(e)),
        };
        stats.persist_ms = t.elapsed().as_millis() as u64;

        // ── Recognize ────────────────────────────────────────────────────
        run.advance();
        let t = Instant::now();
        let text = match self.recognizer.recognize(&locator).await {
            Ok(text) => text,
            Err(e) => return Err(run.fail(e)),
        };
        stats.recognize_ms = t.elapsed().as_millis() as u64;
        stats.text_chars = text.as_str().chars().count();
        if text.is_empty() {
            info!("No text detected in {}", locator);
        }

        // ── Extract ──────────────────────────────────────────────────────
        run.advance();
        let t = Instant::now();
        let extraction = match self.extractor.extract(&text).await {
            Ok(extraction) => extraction,
            Err(e) => return Err(run.fail(e)),
        };
        stats.extract_ms = t.elapsed().as_millis() as u64;

        // ── Normalize ────────────────────────────────────────────────────
        run.advance();
        let record = self
            .normalizer
            .normalize(&extraction.candidate, &locator, &text, job.received_at);

        // ── Sink ─────────────────────────────────────────────────────────
        run.advance();
        let t = Instant::now();
        let ack = match self.sink.append(&record).await {
            Ok(ack) => ack,
            Err(e) => return Err(run.fail(e)),
        };
        stats.sink_ms = t.elapsed().as_millis() as u64;

        run.advance();
        stats.total_ms = total_start.elapsed().as_millis() as u64;
        info!(
            "Ingested {} via {}/{}: {} chars, {}ms total",
            locator,
            self.recognizer.name(),
            self.sink.name(),
            stats.text_chars,
            stats.total_ms
        );

        Ok(IngestOutput {
            locator,
            record,
            ack,
            degraded: extraction.degraded,
            stats,
        })
    }

    /// Ingest an image file from disk (used by the one-shot CLI).
    pub async fn ingest_path(&self, path: impl AsRef<Path>) -> Result<IngestOutput, IngestError> {
        let path = path.as_ref();
        let payload = tokio::fs::read(path).await.map_err(|e| {
            IngestError::InvalidUpload(format!("cannot read '{}': {e}", path.display()))
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let content_type = resolve_content_type("", &payload);
        self.ingest(UploadJob::new(filename, payload, content_type))
            .await
    }
}

/// State tracking for one run; reports transitions to the observer.
struct Run<'a> {
    job: &'a str,
    state: PipelineState,
    observer: Option<&'a dyn IngestObserver>,
}

impl<'a> Run<'a> {
    fn new(job: &'a str, observer: Option<&'a dyn IngestObserver>) -> Self {
        Self {
            job,
            state: PipelineState::Received,
            observer,
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.state.next() {
            self.transition(next);
        }
    }

    fn fail(&mut self, err: IngestError) -> IngestError {
        warn!("'{}' failed while {}: {}", self.job, self.state, err);
        let failed = self.state.fail(err.to_string());
        self.transition(failed);
        err
    }

    fn transition(&mut self, to: PipelineState) {
        debug!("'{}': {} → {}", self.job, self.state, to);
        if let Some(observer) = self.observer {
            observer.on_transition(self.job, &self.state, &to);
        }
        self.state = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<(PipelineState, PipelineState)>>);

    impl IngestObserver for Log {
        fn on_transition(&self, _job: &str, from: &PipelineState, to: &PipelineState) {
            self.0.lock().unwrap().push((from.clone(), to.clone()));
        }
    }

    #[test]
    fn run_reports_from_and_to() {
        let log = Log::default();
        let mut run = Run::new("card.png", Some(&log));
        run.advance();
        run.advance();
        let err = run.fail(IngestError::RecognitionFailure {
            locator: "1_card.png".into(),
            reason: "quota".into(),
        });

        assert!(matches!(err, IngestError::RecognitionFailure { .. }));
        let seen = log.0.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (PipelineState::Received, PipelineState::Persisting));
        assert_eq!(seen[1].1, PipelineState::Recognizing);
        assert!(matches!(
            &seen[2],
            (PipelineState::Recognizing, PipelineState::Failed { stage: crate::error::Stage::Recognize, .. })
        ));
    }

    #[test]
    fn failed_run_does_not_advance() {
        let mut run = Run::new("card.png", None);
        run.fail(IngestError::InvalidUpload("empty".into()));
        run.advance();
        assert!(matches!(run.state, PipelineState::Failed { .. }));
    }
}
