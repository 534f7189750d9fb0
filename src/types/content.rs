//! Content blocks for multi-part messages.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// A block of content within a message, in the OpenAI-compatible wire shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text content
    Text { text: String },
    /// Image referenced by URL (usually a `data:` URL)
    ImageUrl { image_url: ImageUrl },
}

/// Image reference inside an image block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentBlock {
    /// Create a new text content block
    pub fn text<S: Into<String>>(text: S) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image block from an existing URL
    pub fn image_url<S: Into<String>>(url: S) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    /// Create an image block by embedding raw bytes as a base64 `data:` URL
    pub fn image_bytes(bytes: &[u8], mime_type: &str) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self::image_url(format!("data:{};base64,{}", mime_type, encoded))
    }

    /// Get the text content if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let block = ContentBlock::text("hello");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hello"}));

        let block = ContentBlock::image_url("https://example.test/ecg.png");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "image_url", "image_url": {"url": "https://example.test/ecg.png"}})
        );
    }

    #[test]
    fn test_image_bytes_builds_data_url() {
        let block = ContentBlock::image_bytes(b"abc", "image/png");
        match block {
            ContentBlock::ImageUrl { image_url } => {
                assert_eq!(image_url.url, "data:image/png;base64,YWJj");
            }
            other => panic!("expected image block, got {:?}", other),
        }
    }
}
