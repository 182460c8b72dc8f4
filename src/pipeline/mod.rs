//! Pipeline stages for business-card ingestion.
//!
//! Each submodule implements exactly one stage. External capabilities sit
//! behind a trait per stage so deployments can swap backends (GCS or a local
//! directory, Cloud Vision or a vision LLM, a spreadsheet API or a JSONL
//! file) and tests can substitute in-memory stubs.
//!
//! ## Data Flow
//!
//! ```text
//! persist ──▶ recognize ──▶ extract ──▶ normalize ──▶ sink
//! (blob)       (OCR)         (LLM)       (schema)      (row)
//! ```
//!
//! 1. [`persist`]   — issue a `{millis}_{filename}` locator and store the bytes
//! 2. [`recognize`] — OCR the stored image; "no text" is an empty string
//! 3. [`extract`]   — one completion call; bad content degrades, bad transport aborts
//! 4. [`normalize`] — coerce the candidate to the canonical keys; cannot fail
//! 5. [`sink`]      — append the row; no retry, no idempotency
//!
//! [`encode`] is shared by the stages that hand images to a vision model.

pub mod encode;
pub mod extract;
pub mod normalize;
pub mod persist;
pub mod recognize;
pub mod sink;
