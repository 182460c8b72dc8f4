//! Image encoding: uploaded bytes → base64 `ImageData`, plus content-type sniffing.
//!
//! Browsers frequently post camera captures as `application/octet-stream`
//! or with no type at all. The declared type is stored with the blob and
//! forwarded to vision models, so a generic declaration is replaced with the
//! type sniffed from the magic bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use tracing::debug;

/// Declared types that carry no information about the image format.
const GENERIC_TYPES: [&str; 3] = ["", "application/octet-stream", "binary/octet-stream"];

/// Pick the content type to store and forward.
///
/// A specific declared type wins; otherwise the magic bytes decide, and an
/// unrecognised payload falls back to `application/octet-stream`.
pub fn resolve_content_type(declared: &str, payload: &[u8]) -> String {
    let declared = declared.trim();
    if !GENERIC_TYPES.contains(&declared.to_ascii_lowercase().as_str()) {
        return declared.to_string();
    }
    match image::guess_format(payload) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => "application/octet-stream".to_string(),
    }
}

/// Whether the payload's magic bytes match a supported image format.
pub fn looks_like_image(payload: &[u8]) -> bool {
    image::guess_format(payload).is_ok()
}

/// Wrap raw image bytes as a base64 attachment for a vision model.
///
/// Sent with `detail: "high"`; card small print does not survive `low`.
pub fn encode_image(payload: &[u8], content_type: &str) -> ImageData {
    let b64 = STANDARD.encode(payload);
    debug!("Encoded image → {} bytes base64", b64.len());
    ImageData::new(b64, content_type).with_detail("high")
}
