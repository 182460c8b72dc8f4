//! Error types for the bizcard-ingest library.
//!
//! Two distinct failure modes exist and only one of them is an error:
//!
//! * [`IngestError`] — **Fatal**: a transport-class failure at one pipeline
//!   stage (storage rejected the write, OCR timed out, the completion API or
//!   the spreadsheet API refused the call). The pipeline aborts immediately
//!   and the caller receives a single uniform error object.
//!
//! * Content degradation — **Not an error**: the completion API answered,
//!   but not with usable JSON. The extractor substitutes an all-empty
//!   candidate and the pipeline continues (see
//!   [`crate::pipeline::extract::Extraction::degraded`]).
//!
//! Every fatal variant knows which [`Stage`] produced it, so the orchestrator
//! and the HTTP layer never have to guess where a failure came from.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Request validation before any external call.
    Upload,
    Persist,
    Recognize,
    Extract,
    Normalize,
    Sink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Persist => "persist",
            Stage::Recognize => "recognize",
            Stage::Extract => "extract",
            Stage::Normalize => "normalize",
            Stage::Sink => "sink",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All fatal errors returned by the bizcard-ingest library.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Upload errors ─────────────────────────────────────────────────────
    /// The request did not carry a usable image.
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// The request body exceeded the configured size limit.
    #[error("Upload exceeds the {limit}-byte limit; resize the image or raise the server body limit")]
    PayloadTooLarge { limit: usize },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The blob store was unreachable or rejected the write.
    #[error("Failed to store '{locator}': {reason}")]
    StorageFailure { locator: String, reason: String },

    // ── Recognition errors ────────────────────────────────────────────────
    /// The OCR capability errored or returned a malformed response.
    #[error("Text recognition failed for '{locator}': {reason}")]
    RecognitionFailure { locator: String, reason: String },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The completion capability could not be reached or refused the call.
    ///
    /// A completion that *succeeds* with unusable content is not reported
    /// here; it degrades to an empty candidate instead.
    #[error("Field extraction failed: {reason}")]
    ExtractionFailure { reason: String },

    /// The configured LLM provider could not be constructed (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Sink errors ───────────────────────────────────────────────────────
    /// The tabular store rejected the append.
    ///
    /// `status` carries the upstream HTTP status when one was received;
    /// `None` means the request never got a response (DNS, TLS, timeout).
    #[error("Record sink rejected the row{}: {reason}", http_suffix(.status))]
    SinkFailure { status: Option<u16>, reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl IngestError {
    /// The stage this error is attributed to.
    ///
    /// Configuration and internal errors have no stage of their own; they
    /// are reported against the stage that was running when they surfaced,
    /// which the orchestrator tracks separately.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            IngestError::InvalidUpload(_) | IngestError::PayloadTooLarge { .. } => {
                Some(Stage::Upload)
            }
            IngestError::StorageFailure { .. } => Some(Stage::Persist),
            IngestError::RecognitionFailure { .. } => Some(Stage::Recognize),
            IngestError::ExtractionFailure { .. } | IngestError::ProviderNotConfigured { .. } => {
                Some(Stage::Extract)
            }
            IngestError::SinkFailure { .. } => Some(Stage::Sink),
            IngestError::InvalidConfig(_) | IngestError::Internal(_) => None,
        }
    }

    /// Short machine-readable classification, e.g. `"storage_failure"`.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::InvalidUpload(_) => "invalid_upload",
            IngestError::PayloadTooLarge { .. } => "payload_too_large",
            IngestError::StorageFailure { .. } => "storage_failure",
            IngestError::RecognitionFailure { .. } => "recognition_failure",
            IngestError::ExtractionFailure { .. } => "extraction_failure",
            IngestError::ProviderNotConfigured { .. } => "provider_not_configured",
            IngestError::SinkFailure { .. } => "sink_failure",
            IngestError::InvalidConfig(_) => "invalid_config",
            IngestError::Internal(_) => "internal",
        }
    }

    /// HTTP status the `/ocr` endpoint answers with for this error.
    ///
    /// Sink failures map to `502 Bad Gateway`. A bad upload is the caller's
    /// fault (`400`, or `413` when it is too big). Everything else is a `500`.
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::InvalidUpload(_) => 400,
            IngestError::PayloadTooLarge { .. } => 413,
            IngestError::SinkFailure { .. } => 502,
            _ => 500,
        }
    }
}
