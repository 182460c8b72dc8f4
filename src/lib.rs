//! # bizcard-ingest
//!
//! Turn a photographed business card into one row in a spreadsheet.
//!
//! An uploaded image is stored, OCR'd, handed to a language model that maps
//! the free text onto a fixed set of contact fields, normalised so every
//! field is present, and appended to an external table. The model's answer
//! is never trusted: whatever it returns, the stored row has exactly the
//! configured columns.
//!
//! ## Pipeline Overview
//!
//! ```text
//! image upload
//!  │
//!  ├─ 1. Persist    store bytes as {millis}_{filename} (GCS or local dir)
//!  ├─ 2. Recognize  OCR via Cloud Vision or a vision LLM
//!  ├─ 3. Extract    one completion call → untrusted JSON candidate
//!  ├─ 4. Normalize  coerce to the canonical keys, "" for anything missing
//!  ├─ 5. Sink       append row (fields + timestamp + raw_json)
//!  └─ 6. Respond    {file, structured, sink: "ok"}
//! ```
//!
//! Stages run strictly in order with no retries; the first failure aborts the
//! run and is reported with the [`Stage`] it happened in.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bizcard_ingest::pipeline::extract::LlmCompletion;
//! use bizcard_ingest::pipeline::persist::LocalBlobStore;
//! use bizcard_ingest::pipeline::recognize::{VisionApiRecognizer, VisionConfig};
//! use bizcard_ingest::pipeline::sink::JsonlRecordSink;
//! use bizcard_ingest::{IngestConfig, Ingestor};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(IngestConfig::default());
//!     let store = Arc::new(LocalBlobStore::open("./uploads")?);
//!     let vision = VisionConfig {
//!         api_key: std::env::var("GOOGLE_VISION_API_KEY").ok(),
//!         ..Default::default()
//!     };
//!     let ingestor = Ingestor::new(
//!         config.clone(),
//!         store.clone(),
//!         Arc::new(VisionApiRecognizer::new(vision, store)?),
//!         Arc::new(LlmCompletion::from_config(&config)?),
//!         Arc::new(JsonlRecordSink::new("cards.jsonl")),
//!     );
//!     let output = ingestor.ingest_path("card.jpg").await?;
//!     println!("{}", serde_json::to_string_pretty(&output.response())?);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `bizcard` binary (clap, indicatif, anyhow, tracing-subscriber, dotenvy) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod fields;
pub mod ingest;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod server;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestConfig, IngestConfigBuilder, UnknownFieldPolicy};
pub use error::{IngestError, Stage};
pub use fields::{CanonicalFieldSet, DEFAULT_FIELDS};
pub use ingest::Ingestor;
pub use output::{
    BlobLocator, CandidateRecord, IngestOutput, IngestStats, RecognizedText, SinkAck,
    StructuredRecord, UploadJob,
};
pub use progress::{IngestObserver, Observer, PipelineState};
pub use server::{create_router, serve, AppState, ServerConfig};
