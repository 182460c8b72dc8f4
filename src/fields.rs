//! The canonical field set: the keys every structured record carries.
//!
//! The set is ordered. Order matters twice: the extraction prompt lists the
//! keys in this order (models omit fewer keys when the list is explicit and
//! stable), and the spreadsheet columns are written in this order.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};

/// Column names reserved for ingestion metadata in every stored row.
pub const RESERVED_COLUMNS: [&str; 2] = ["timestamp", "raw_json"];

/// Default business-card fields, in prompt and column order.
pub const DEFAULT_FIELDS: [&str; 7] = [
    "name",
    "furigana",
    "company",
    "address",
    "tel",
    "email",
    "industry",
];

/// A fixed, ordered, duplicate-free list of field keys.
///
/// Construct once at startup and share read-only; there is no API to mutate
/// a set after it has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct CanonicalFieldSet {
    keys: Vec<String>,
}

impl CanonicalFieldSet {
    /// Validate and build a field set.
    ///
    /// Keys must be non-empty ASCII identifiers (`[A-Za-z0-9_]`), unique, and
    /// must not shadow a [`RESERVED_COLUMNS`] entry.
    pub fn new<I, S>(keys: I) -> Result<Self, IngestError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return Err(IngestError::InvalidConfig(
                "Canonical field set must contain at least one key".into(),
            ));
        }
        for (i, key) in keys.iter().enumerate() {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(IngestError::InvalidConfig(format!(
                    "Field key {key:?} must be a non-empty ASCII identifier"
                )));
            }
            if RESERVED_COLUMNS.contains(&key.as_str()) {
                return Err(IngestError::InvalidConfig(format!(
                    "Field key {key:?} collides with a reserved metadata column"
                )));
            }
            if keys[..i].contains(key) {
                return Err(IngestError::InvalidConfig(format!(
                    "Field key {key:?} is listed twice"
                )));
            }
        }
        Ok(Self { keys })
    }

    /// Parse a comma-separated list such as `"name,company,tel"`.
    pub fn parse_list(s: &str) -> Result<Self, IngestError> {
        Self::new(s.split(',').map(str::trim).filter(|k| !k.is_empty()))
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

impl Default for CanonicalFieldSet {
    fn default() -> Self {
        Self {
            keys: DEFAULT_FIELDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl TryFrom<Vec<String>> for CanonicalFieldSet {
    type Error = IngestError;

    fn try_from(keys: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(keys)
    }
}

impl From<CanonicalFieldSet> for Vec<String> {
    fn from(set: CanonicalFieldSet) -> Self {
        set.keys
    }
}
