//! Configuration types for the ingestion pipeline.
//!
//! All pipeline behaviour that is not specific to one storage or sink
//! backend is controlled through [`IngestConfig`], built via its
//! [`IngestConfigBuilder`]. The config is constructed once at process start
//! and shared read-only (`Arc<IngestConfig>`) by every request; nothing in
//! the crate mutates it afterwards.
//!
//! Backend-specific settings (bucket names, API endpoints, credentials) live
//! next to their adapters in [`crate::pipeline`].

use crate::error::IngestError;
use crate::fields::CanonicalFieldSet;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Configuration for the ingestion pipeline.
///
/// Built via [`IngestConfig::builder()`] or using [`IngestConfig::default()`].
///
/// # Example
/// ```rust
/// use bizcard_ingest::{IngestConfig, UnknownFieldPolicy};
///
/// let config = IngestConfig::builder()
///     .model("gpt-4.1-nano")
///     .unknown_fields(UnknownFieldPolicy::Preserve)
///     .api_timeout_secs(30)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Keys every structured record carries, in column order.
    /// Default: `name, furigana, company, address, tel, email, industry`.
    pub fields: CanonicalFieldSet,

    /// What to do with keys the completion invents. Default: [`UnknownFieldPolicy::Drop`].
    pub unknown_fields: UnknownFieldPolicy,

    /// LLM model identifier, e.g. "gpt-4.1-nano", "claude-sonnet-4-20250514".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature for the extraction completion. Default: 0.0.
    ///
    /// Field extraction is transcription, not writing; any creativity shows
    /// up as invented phone numbers.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per card. Default: 1024.
    pub max_tokens: usize,

    /// Custom extraction system prompt. If None, one is built from `fields`.
    pub system_prompt: Option<String>,

    /// Per-call timeout for every external capability, in seconds. Default: 60.
    pub api_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            fields: CanonicalFieldSet::default(),
            unknown_fields: UnknownFieldPolicy::default(),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 1024,
            system_prompt: None,
            api_timeout_secs: 60,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("fields", &self.fields)
            .field("unknown_fields", &self.unknown_fields)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("system_prompt", &self.system_prompt.as_ref().map(|p| p.len()))
            .field("api_timeout_secs", &self.api_timeout_secs)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn fields(mut self, fields: CanonicalFieldSet) -> Self {
        self.config.fields = fields;
        self
    }

    pub fn unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.config.unknown_fields = policy;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.api_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.max_tokens < 16 {
            return Err(IngestError::InvalidConfig(format!(
                "max_tokens must be ≥ 16, got {}",
                c.max_tokens
            )));
        }
        if let Some(prompt) = &c.system_prompt {
            if prompt.trim().is_empty() {
                return Err(IngestError::InvalidConfig(
                    "Custom system prompt must not be empty".into(),
                ));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Policy for candidate keys that are not part of the canonical field set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    /// Discard unknown keys. (default)
    #[default]
    Drop,
    /// Keep unknown keys verbatim inside the stored `raw_json` envelope.
    #[cfg_attr(feature = "cli", value(alias = "keep"))]
    Preserve,
}

impl FromStr for UnknownFieldPolicy {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop" => Ok(UnknownFieldPolicy::Drop),
            "preserve" | "keep" => Ok(UnknownFieldPolicy::Preserve),
            other => Err(IngestError::InvalidConfig(format!(
                "unknown-field policy '{other}': expected drop or preserve"
            ))),
        }
    }
}
