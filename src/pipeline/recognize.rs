//! Text recognition: turn a stored card image into plain text.
//!
//! Two backends are provided:
//!
//! * [`VisionApiRecognizer`] — Google Cloud Vision `DOCUMENT_TEXT_DETECTION`.
//!   When the blob lives in GCS the API reads it directly via its `gs://`
//!   URI; otherwise the bytes are read back from the store and inlined.
//! * [`LlmVisionRecognizer`] — any vision-capable chat model reached through
//!   `edgequake-llm`, prompted to transcribe the card verbatim.
//!
//! Both treat "no text found" as an empty [`RecognizedText`], never as an
//! error: a blank card is a valid input for the rest of the pipeline.

use crate::error::IngestError;
use crate::output::{BlobLocator, RecognizedText};
use crate::pipeline::encode::{encode_image, resolve_content_type};
use crate::pipeline::persist::{excerpt, BlobStore};
use crate::prompts::RECOGNITION_SYSTEM_PROMPT;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Capability: extract plain text from a persisted image.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Short backend name for logs, e.g. `"vision"`.
    fn name(&self) -> &'static str;

    /// Recognize the text of one stored image.
    ///
    /// Returns an empty text when nothing was detected.
    async fn recognize(&self, locator: &BlobLocator) -> Result<RecognizedText, IngestError>;
}

// ── Google Cloud Vision ──────────────────────────────────────────────────

/// Settings for [`VisionApiRecognizer`].
#[derive(Debug, Clone)]
pub struct VisionConfig {
    /// API key, sent as the `key` query parameter.
    pub api_key: Option<String>,
    /// OAuth2 bearer token; used when no API key is set.
    pub access_token: Option<String>,
    /// API base URL. Default: `https://vision.googleapis.com`.
    pub endpoint: String,
    /// BCP-47 hints, e.g. `["ja", "en"]`. Empty lets the API auto-detect.
    pub language_hints: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            access_token: None,
            endpoint: "https://vision.googleapis.com".to_string(),
            language_hints: Vec::new(),
            timeout_secs: 60,
        }
    }
}

pub struct VisionApiRecognizer {
    client: reqwest::Client,
    config: VisionConfig,
    store: Arc<dyn BlobStore>,
}

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest {
    image: VisionImage,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum VisionImage {
    #[serde(rename = "source")]
    Source {
        #[serde(rename = "gcsImageUri")]
        gcs_image_uri: String,
    },
    #[serde(rename = "content")]
    Content(String),
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext {
    language_hints: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    #[serde(default)]
    error: Option<VisionStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct VisionStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl VisionApiRecognizer {
    pub fn new(config: VisionConfig, store: Arc<dyn BlobStore>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            store,
        })
    }

    /// Reference the image by URI when the store has one, else inline it.
    async fn image_for(&self, locator: &BlobLocator) -> Result<VisionImage, IngestError> {
        match self.store.uri(locator) {
            Some(uri) if uri.starts_with("gs://") => Ok(VisionImage::Source { gcs_image_uri: uri }),
            _ => {
                let bytes = self.store.get(locator).await.map_err(|e| {
                    IngestError::RecognitionFailure {
                        locator: locator.to_string(),
                        reason: format!("cannot read image back: {e}"),
                    }
                })?;
                Ok(VisionImage::Content(STANDARD.encode(bytes)))
            }
        }
    }

    fn build_request(&self, image: VisionImage) -> AnnotateRequest {
        let image_context = if self.config.language_hints.is_empty() {
            None
        } else {
            Some(ImageContext {
                language_hints: self.config.language_hints.clone(),
            })
        };
        AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image,
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context,
            }],
        }
    }
}

#[async_trait]
impl TextRecognizer for VisionApiRecognizer {
    fn name(&self) -> &'static str {
        "vision"
    }

    async fn recognize(&self, locator: &BlobLocator) -> Result<RecognizedText, IngestError> {
        let fail = |reason: String| IngestError::RecognitionFailure {
            locator: locator.to_string(),
            reason,
        };
        let start = Instant::now();
        let body = self.build_request(self.image_for(locator).await?);

        let url = format!(
            "{}/v1/images:annotate",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            request = request.query(&[("key", key.as_str())]);
        } else if let Some(token) = &self.config.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                fail(format!("timed out after {}s", self.config.timeout_secs))
            } else {
                fail(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(fail(format!("HTTP {status}: {}", excerpt(&text))));
        }
        let parsed: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| fail(format!("malformed response: {e}")))?;

        let first = parsed.responses.into_iter().next().unwrap_or_default();
        if let Some(err) = first.error {
            if err.code != 0 {
                return Err(fail(format!("API error {}: {}", err.code, err.message)));
            }
        }
        let annotation = first.full_text_annotation.unwrap_or_default();
        info!(
            "Recognized {} chars on {} page(s) for {} in {}ms",
            annotation.text.chars().count(),
            annotation.pages.len(),
            locator,
            start.elapsed().as_millis()
        );
        Ok(RecognizedText::new(annotation.text))
    }
}

// ── Vision LLM ───────────────────────────────────────────────────────────

/// Transcribes card images with a vision-capable chat model.
pub struct LlmVisionRecognizer {
    provider: Arc<dyn LLMProvider>,
    store: Arc<dyn BlobStore>,
    max_tokens: usize,
    timeout: Duration,
}

impl LlmVisionRecognizer {
    pub fn new(provider: Arc<dyn LLMProvider>, store: Arc<dyn BlobStore>, timeout_secs: u64) -> Self {
        Self {
            provider,
            store,
            max_tokens: 1024,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl TextRecognizer for LlmVisionRecognizer {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn recognize(&self, locator: &BlobLocator) -> Result<RecognizedText, IngestError> {
        let fail = |reason: String| IngestError::RecognitionFailure {
            locator: locator.to_string(),
            reason,
        };
        let bytes = self
            .store
            .get(locator)
            .await
            .map_err(|e| fail(format!("cannot read image back: {e}")))?;
        let mime = resolve_content_type("", &bytes);

        let messages = vec![
            ChatMessage::system(RECOGNITION_SYSTEM_PROMPT),
            ChatMessage::user_with_images("", vec![encode_image(&bytes, &mime)]),
        ];
        let options = CompletionOptions {
            temperature: Some(0.0),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| fail(format!("timed out after {}s", self.timeout.as_secs())))?
            .map_err(|e| fail(e.to_string()))?;

        debug!(
            "Vision transcription for {}: {} input tokens, {} output tokens",
            locator, response.prompt_tokens, response.completion_tokens
        );
        Ok(RecognizedText::new(response.content.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_by_gcs_uri_serialises_to_vision_shape() {
        let image = VisionImage::Source {
            gcs_image_uri: "gs://cards/1_a.jpg".into(),
        };
        let req = AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image,
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: Some(ImageContext {
                    language_hints: vec!["ja".into()],
                }),
            }],
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(
            v["requests"][0]["image"]["source"]["gcsImageUri"],
            "gs://cards/1_a.jpg"
        );
        assert_eq!(v["requests"][0]["features"][0]["type"], "DOCUMENT_TEXT_DETECTION");
        assert_eq!(v["requests"][0]["imageContext"]["languageHints"][0], "ja");
    }

    #[test]
    fn inline_content_serialises_as_string() {
        let v = serde_json::to_value(VisionImage::Content("QUJD".into())).unwrap();
        assert_eq!(v["content"], "QUJD");
    }

    #[test]
    fn response_without_annotation_means_no_text() {
        let parsed: AnnotateResponse = serde_json::from_str(r#"{"responses":[{}]}"#).unwrap();
        let first = parsed.responses.into_iter().next().unwrap();
        assert!(first.full_text_annotation.is_none());
        assert!(first.error.is_none());

        let empty: AnnotateResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.responses.is_empty());
    }
}
