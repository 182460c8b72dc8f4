//! Field extraction: recognized text → untrusted candidate record.
//!
//! This stage is intentionally thin — the instruction contract lives in
//! [`crate::prompts`] and schema enforcement lives in
//! [`crate::pipeline::normalize`]. What remains here is the failure policy,
//! which separates two very different ways the completion can go wrong:
//!
//! | Failure | Example | Policy |
//! |---------|---------|--------|
//! | Transport | 401, 429, DNS, timeout | abort with [`IngestError::ExtractionFailure`], no retry |
//! | Content | prose, truncated JSON, a JSON array | degrade to an all-empty candidate, continue |
//!
//! Degrading keeps the pipeline producing a structurally valid (if empty)
//! row when the model misbehaves, while an unreachable API is still reported.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::fields::CanonicalFieldSet;
use crate::output::{CandidateRecord, RecognizedText};
use crate::prompts::{extraction_system_prompt, extraction_user_message};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capability: one chat-style completion (system + user → free text).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Run one completion. Errors are transport-class only.
    async fn complete(&self, system: &str, user: &str) -> Result<String, IngestError>;
}

// ── edgequake-llm adapter ────────────────────────────────────────────────

/// [`CompletionClient`] backed by an `edgequake-llm` provider.
pub struct LlmCompletion {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
    timeout: Duration,
}

impl LlmCompletion {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            options: build_options(config),
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Resolve the provider from `config` (see [`resolve_provider`]).
    pub fn from_config(config: &IngestConfig) -> Result<Self, IngestError> {
        Ok(Self::new(resolve_provider(config)?, config))
    }
}

#[async_trait]
impl CompletionClient for LlmCompletion {
    async fn complete(&self, system: &str, user: &str) -> Result<String, IngestError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let start = Instant::now();

        let response = tokio::time::timeout(
            self.timeout,
            self.provider.chat(&messages, Some(&self.options)),
        )
        .await
        .map_err(|_| IngestError::ExtractionFailure {
            reason: format!("completion timed out after {}s", self.timeout.as_secs()),
        })?
        .map_err(|e| IngestError::ExtractionFailure {
            reason: e.to_string(),
        })?;

        debug!(
            "Completion: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );
        Ok(response.content)
    }
}

/// Build `CompletionOptions` from the ingest config.
fn build_options(config: &IngestConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        ..Default::default()
    }
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`) — used as-is.
/// 2. **Named provider + model** (`config.provider_name`) — built by
///    [`ProviderFactory::create_llm_provider`], which reads the matching API
///    key (`OPENAI_API_KEY`, …) from the environment.
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **OpenAI key present** — `openai` with the configured or default model.
/// 5. **Full auto-detection** (`ProviderFactory::from_env`).
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);

    if let Some(ref name) = config.provider_name {
        return create_provider(name, model);
    }

    if let (Ok(prov), Ok(env_model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !env_model.is_empty() {
            return create_provider(&prov, &env_model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

fn create_provider(name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{e}"),
        }
    })
}

// ── Extractor ────────────────────────────────────────────────────────────

/// Outcome of the extract stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub candidate: CandidateRecord,
    /// Set when the completion content was unusable and the candidate was
    /// replaced with all-empty values.
    pub degraded: Option<String>,
}

/// The extract stage: prompt the completion and parse its answer.
pub struct FieldExtractor {
    client: Arc<dyn CompletionClient>,
    fields: CanonicalFieldSet,
    system_prompt: String,
}

impl FieldExtractor {
    pub fn new(client: Arc<dyn CompletionClient>, config: &IngestConfig) -> Self {
        let system_prompt = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| extraction_system_prompt(&config.fields));
        Self {
            client,
            fields: config.fields.clone(),
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Extract a candidate record from recognized text.
    ///
    /// Blank text skips the completion call entirely: there is nothing to
    /// extract, and a model asked about nothing tends to invent a card.
    pub async fn extract(&self, text: &RecognizedText) -> Result<Extraction, IngestError> {
        if text.is_empty() {
            info!("No text recognized; skipping completion");
            return Ok(Extraction {
                candidate: empty_candidate(&self.fields),
                degraded: None,
            });
        }

        let raw = self
            .client
            .complete(&self.system_prompt, &extraction_user_message(text.as_str()))
            .await?;

        let extraction = parse_candidate(&raw, &self.fields);
        if let Some(ref why) = extraction.degraded {
            warn!("Completion content unusable ({}); using empty record", why);
        }
        Ok(extraction)
    }
}

/// A candidate mapping every canonical key to `""`.
pub fn empty_candidate(fields: &CanonicalFieldSet) -> CandidateRecord {
    fields
        .iter()
        .map(|k| (k.to_string(), Value::String(String::new())))
        .collect()
}

static RE_JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n?(.*?)\n?\s*```$").unwrap());

/// Parse completion content into a candidate, degrading on anything that is
/// not a JSON object.
///
/// Tried in order: the trimmed content, the content of an outer code fence,
/// and the span from the first `{` to the last `}` (models sometimes prefix
/// "Here is the JSON:").
pub fn parse_candidate(raw: &str, fields: &CanonicalFieldSet) -> Extraction {
    let trimmed = raw.trim();
    let mut attempts: Vec<&str> = vec![trimmed];
    if let Some(caps) = RE_JSON_FENCE.captures(trimmed) {
        if let Some(inner) = caps.get(1) {
            attempts.push(inner.as_str().trim());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            attempts.push(&trimmed[start..=end]);
        }
    }

    let mut reason = if trimmed.is_empty() {
        "empty completion".to_string()
    } else {
        "completion is not valid JSON".to_string()
    };
    for candidate in attempts {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => {
                return Extraction {
                    candidate: map,
                    degraded: None,
                }
            }
            Ok(other) => reason = format!("completion is JSON {} not an object", kind_of(&other)),
            Err(_) => {}
        }
    }

    Extraction {
        candidate: empty_candidate(fields),
        degraded: Some(reason),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedClient {
        reply: Result<String, String>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedClient {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing(reason: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(reason.to_string()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, system: &str, user: &str) -> Result<String, IngestError> {
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), user.to_string()));
            self.reply
                .clone()
                .map_err(|reason| IngestError::ExtractionFailure { reason })
        }
    }

    fn fields() -> CanonicalFieldSet {
        CanonicalFieldSet::default()
    }

    #[test]
    fn build_options_defaults() {
        let opts = build_options(&IngestConfig::default());
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(1024));
    }

    #[test]
    fn plain_object_is_accepted() {
        let e = parse_candidate(r#"{"name":"A","extra":1}"#, &fields());
        assert!(e.degraded.is_none());
        assert_eq!(e.candidate["name"], "A");
        assert_eq!(e.candidate["extra"], 1);
    }

    #[test]
    fn fenced_object_is_accepted() {
        let e = parse_candidate("```json\n{\"name\": \"A\"}\n```", &fields());
        assert!(e.degraded.is_none());
        assert_eq!(e.candidate["name"], "A");
    }

    #[test]
    fn prefixed_object_is_accepted() {
        let e = parse_candidate("Here is the JSON:\n{\"tel\": \"03\"}\nThanks!", &fields());
        assert!(e.degraded.is_none());
        assert_eq!(e.candidate["tel"], "03");
    }

    #[test]
    fn prose_degrades_to_all_empty() {
        let e = parse_candidate("I could not read this card.", &fields());
        assert!(e.degraded.is_some());
        assert_eq!(e.candidate.len(), 7);
        assert!(e.candidate.values().all(|v| v.as_str() == Some("")));
    }

    #[test]
    fn array_and_truncated_json_degrade() {
        let arr = parse_candidate(r#"["name"]"#, &fields());
        assert_eq!(arr.degraded.as_deref(), Some("completion is JSON array not an object"));
        let cut = parse_candidate(r#"{"name": "A", "comp"#, &fields());
        assert!(cut.degraded.is_some());
        let empty = parse_candidate("   ", &fields());
        assert_eq!(empty.degraded.as_deref(), Some("empty completion"));
    }

    #[tokio::test]
    async fn extract_sends_prompt_and_text() {
        let client = ScriptedClient::replying(r#"{"name":"山田太郎"}"#);
        let extractor = FieldExtractor::new(client.clone(), &IngestConfig::default());
        let out = extractor
            .extract(&RecognizedText::new("山田太郎"))
            .await
            .unwrap();
        assert_eq!(out.candidate["name"], "山田太郎");

        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].0.contains("\"furigana\""));
        assert!(calls[0].1.contains("山田太郎"));
    }

    #[tokio::test]
    async fn transport_failure_aborts() {
        let client = ScriptedClient::failing("401 Unauthorized");
        let extractor = FieldExtractor::new(client, &IngestConfig::default());
        let err = extractor
            .extract(&RecognizedText::new("text"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::ExtractionFailure { .. }));
    }

    #[tokio::test]
    async fn blank_text_skips_completion() {
        let client = ScriptedClient::failing("must not be called");
        let extractor = FieldExtractor::new(client.clone(), &IngestConfig::default());
        let out = extractor.extract(&RecognizedText::new("")).await.unwrap();
        assert!(out.degraded.is_none());
        assert_eq!(out.candidate, empty_candidate(&fields()));
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn custom_system_prompt_overrides_builtin() {
        let config = IngestConfig::builder()
            .system_prompt("Return JSON.")
            .build()
            .unwrap();
        let extractor = FieldExtractor::new(ScriptedClient::replying("{}"), &config);
        assert_eq!(extractor.system_prompt(), "Return JSON.");
    }
}
