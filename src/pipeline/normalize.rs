//! Schema normalisation: untrusted candidate → key-complete record.
//!
//! The completion's output is treated as an untyped map and every canonical
//! key is coerced on its own: present-and-string is kept verbatim, anything
//! else (absent, `null`, a number, a nested object) becomes `""`. Nothing
//! here can fail; a candidate that is complete garbage simply yields a record
//! of empty strings.

use crate::config::UnknownFieldPolicy;
use crate::fields::CanonicalFieldSet;
use crate::output::{BlobLocator, CandidateRecord, RawPayload, RecognizedText, StructuredRecord};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Coerce a candidate to exactly the canonical keys, in canonical order.
pub fn normalize_fields(
    candidate: &CandidateRecord,
    fields: &CanonicalFieldSet,
) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|key| {
            let value = match candidate.get(key) {
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            (key.to_string(), value)
        })
        .collect()
}

/// Candidate keys that are not canonical, verbatim.
pub fn unknown_fields(candidate: &CandidateRecord, fields: &CanonicalFieldSet) -> Map<String, Value> {
    candidate
        .iter()
        .filter(|(k, _)| !fields.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The normalize stage.
#[derive(Debug, Clone)]
pub struct Normalizer {
    fields: CanonicalFieldSet,
    policy: UnknownFieldPolicy,
}

impl Normalizer {
    pub fn new(fields: CanonicalFieldSet, policy: UnknownFieldPolicy) -> Self {
        Self { fields, policy }
    }

    /// Build the record to be stored, attaching ingestion metadata.
    pub fn normalize(
        &self,
        candidate: &CandidateRecord,
        locator: &BlobLocator,
        text: &RecognizedText,
        ingested_at: DateTime<Utc>,
    ) -> StructuredRecord {
        let unknown = match self.policy {
            UnknownFieldPolicy::Drop => None,
            UnknownFieldPolicy::Preserve => {
                let extra = unknown_fields(candidate, &self.fields);
                (!extra.is_empty()).then_some(extra)
            }
        };
        StructuredRecord::new(
            normalize_fields(candidate, &self.fields),
            ingested_at,
            RawPayload {
                file: locator.clone(),
                text: text.as_str().to_string(),
                unknown,
            },
        )
    }
}
