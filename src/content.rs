//! Content codec: one persisted string for mixed text+image messages.
//!
//! A message body is stored as a single opaque string. Plain text stays
//! plain; as soon as images are attached the body becomes a JSON envelope
//! carrying both fields. Decoding is backward-compatible: anything that
//! does not parse as the envelope is treated as plain text, so legacy rows
//! and structured rows read through the same path.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::MAX_IMAGE_BYTES;

/// Decoded message content. Never persisted directly: always re-encoded
/// through [`encode`] before it touches the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichContent {
    pub text: String,
    /// Base64-encoded image payloads, in attachment order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl RichContent {
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }
}

/// Encode text plus images into the persisted content string.
///
/// With no images the text is returned unchanged: no structural wrapping,
/// so a plain round trip is byte-identical.
pub fn encode(text: &str, images: &[String]) -> String {
    if images.is_empty() {
        return text.to_string();
    }
    let rich = RichContent {
        text: text.to_string(),
        images: images.to_vec(),
    };
    serde_json::to_string(&rich).expect("rich content is serializable")
}

/// Decode a persisted content string.
///
/// The structured parse is attempted only when the outer shape looks like
/// the envelope (leading `{`). Any parse failure, including an object
/// without the text field, falls back to plain text with no images.
pub fn decode(content: &str) -> RichContent {
    let trimmed = content.trim_start();
    if trimmed.starts_with('{') {
        if let Ok(rich) = serde_json::from_str::<RichContent>(trimmed) {
            return rich;
        }
    }
    RichContent::text_only(content)
}

/// Check every attached image against the size bound.
///
/// Returns the decoded size of the first oversized image. Sizing uses the
/// base64 payload length, so no allocation or full decode is needed.
pub fn validate_image_sizes(images: &[String]) -> Result<(), usize> {
    for image in images {
        let decoded = decoded_len(image);
        if decoded > MAX_IMAGE_BYTES {
            return Err(decoded);
        }
    }
    Ok(())
}

/// Approximate decoded byte length of a base64 payload (exact for
/// padded standard base64).
fn decoded_len(payload: &str) -> usize {
    let padding = payload.bytes().rev().take_while(|b| *b == b'=').count();
    (payload.len() / 4) * 3 - padding
}

/// Encode raw image bytes into the payload form carried by [`RichContent`].
pub fn encode_image_bytes(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
