//! Data model flowing through the pipeline.
//!
//! ```text
//! UploadJob ─▶ BlobLocator ─▶ RecognizedText ─▶ CandidateRecord ─▶ StructuredRecord ─▶ SinkAck
//!  (request)    (persist)      (recognize)        (extract)          (normalize)        (sink)
//! ```
//!
//! Only [`StructuredRecord`] leaves the process (as a spreadsheet row).
//! Everything else lives exactly as long as one pipeline run.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One in-flight upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// File name as declared by the client.
    pub filename: String,
    /// Raw image bytes.
    pub payload: Vec<u8>,
    /// Content type as declared by the client (may be empty or generic).
    pub content_type: String,
    /// When the request entered the pipeline.
    pub received_at: DateTime<Utc>,
}

impl UploadJob {
    pub fn new(
        filename: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            payload: payload.into(),
            content_type: content_type.into(),
            received_at: Utc::now(),
        }
    }
}

/// Opaque identifier of a persisted image, `{millis}_{filename}`.
///
/// Issued by [`crate::pipeline::persist::LocatorIssuer`]; immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobLocator(String);

impl BlobLocator {
    /// Wrap an already-issued locator string (e.g. read back from a row).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plain text found on the card. Possibly empty, never absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecognizedText(String);

impl RecognizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

/// Untrusted key/value output of the completion model.
pub type CandidateRecord = Map<String, Value>;

/// Audit envelope stored in the `raw_json` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    pub file: BlobLocator,
    pub text: String,
    /// Candidate keys outside the canonical set, kept only under
    /// [`crate::config::UnknownFieldPolicy::Preserve`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown: Option<Map<String, Value>>,
}

/// A key-complete, schema-conforming business-card record.
///
/// Holds exactly one string per canonical field, in canonical order. Values
/// are stored as the model produced them; nothing is validated semantically.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredRecord {
    fields: Vec<(String, String)>,
    /// Ingestion timestamp written to the `timestamp` column.
    pub ingested_at: DateTime<Utc>,
    /// Audit payload written to the `raw_json` column.
    pub raw: RawPayload,
}

impl StructuredRecord {
    pub(crate) fn new(
        fields: Vec<(String, String)>,
        ingested_at: DateTime<Utc>,
        raw: RawPayload,
    ) -> Self {
        Self {
            fields,
            ingested_at,
            raw,
        }
    }

    /// Canonical `(key, value)` pairs in column order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Canonical fields only, in order, as a serialisable view.
    pub fn structured(&self) -> StructuredFields<'_> {
        StructuredFields(&self.fields)
    }

    /// Canonical fields as a candidate map, for re-normalisation.
    pub fn to_candidate(&self) -> CandidateRecord {
        self.fields
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect()
    }

    /// The row appended to the tabular store: canonical fields, then
    /// `timestamp` (RFC 3339, UTC) and `raw_json` (JSON-encoded [`RawPayload`]).
    pub fn to_row(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let mut row = self.to_candidate();
        row.insert(
            "timestamp".into(),
            Value::String(self.ingested_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        row.insert("raw_json".into(), Value::String(serde_json::to_string(&self.raw)?));
        Ok(row)
    }
}

/// Ordered map view over canonical fields.
///
/// `serde_json::Map` sorts its keys unless `preserve_order` is enabled, so
/// the view serialises the pairs directly to keep column order.
#[derive(Debug, Clone, Copy)]
pub struct StructuredFields<'a>(&'a [(String, String)]);

impl Serialize for StructuredFields<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Acknowledgement from the record sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkAck {
    /// Upstream HTTP status, if the sink talks HTTP.
    pub status: Option<u16>,
    /// Rows the sink reports as written.
    pub rows: usize,
}

/// Result of one completed pipeline run.
#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub locator: BlobLocator,
    pub record: StructuredRecord,
    pub ack: SinkAck,
    /// Why extraction degraded to an empty candidate, if it did.
    pub degraded: Option<String>,
    pub stats: IngestStats,
}

impl IngestOutput {
    /// The client-facing body: `{file, structured, sink: "ok"}`.
    ///
    /// The `raw_json` audit payload is stored by the sink but not echoed.
    pub fn response(&self) -> OcrResponse<'_> {
        OcrResponse {
            file: self.locator.as_str(),
            structured: self.record.structured(),
            sink: "ok",
        }
    }
}

/// Success body of `POST /ocr`.
#[derive(Debug, Serialize)]
pub struct OcrResponse<'a> {
    pub file: &'a str,
    pub structured: StructuredFields<'a>,
    pub sink: &'static str,
}

/// Per-stage timings for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    pub persist_ms: u64,
    pub recognize_ms: u64,
    pub extract_ms: u64,
    pub sink_ms: u64,
    pub total_ms: u64,
    /// Characters of recognized text.
    pub text_chars: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StructuredRecord {
        StructuredRecord::new(
            vec![
                ("name".into(), "山田太郎".into()),
                ("company".into(), "".into()),
                ("address".into(), "Tokyo".into()),
            ],
            DateTime::parse_from_rfc3339("2024-05-01T09:30:00Z")
                .unwrap()
                .with_timezone(&Utc),
            RawPayload {
                file: BlobLocator::new("1714555800000_card.jpg"),
                text: "山田太郎".into(),
                unknown: None,
            },
        )
    }

    #[test]
    fn structured_view_keeps_canonical_order() {
        let json = serde_json::to_string(&sample().structured()).unwrap();
        assert_eq!(json, r#"{"name":"山田太郎","company":"","address":"Tokyo"}"#);
    }

    #[test]
    fn row_carries_metadata_columns() {
        let row = sample().to_row().unwrap();
        assert_eq!(row.len(), 5);
        assert_eq!(row["timestamp"], "2024-05-01T09:30:00.000Z");
        let raw: RawPayload = serde_json::from_str(row["raw_json"].as_str().unwrap()).unwrap();
        assert_eq!(raw.file.as_str(), "1714555800000_card.jpg");
        assert_eq!(raw.text, "山田太郎");
        assert!(!row["raw_json"].as_str().unwrap().contains("unknown"));
    }

    #[test]
    fn recognized_text_whitespace_counts_as_empty() {
        assert!(RecognizedText::new(" \n").is_empty());
        assert!(!RecognizedText::new("a").is_empty());
    }
}
