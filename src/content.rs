//! Rich content blocks returned by tools and by a finished execution.

use serde::{Deserialize, Serialize};

/// A single block of content handed back to the conversation.
///
/// Tools without an output schema return these verbatim; the bridge keeps them
/// on the host and the splicer reinserts them into the console output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplexContent {
    /// Plain text.
    Text { text: String },
    /// Base64-encoded image data.
    Image { data: String, media_type: String },
    /// Image referenced by URL.
    ImageUrl { url: String },
}

impl ComplexContent {
    pub fn text(text: impl Into<String>) -> Self {
        ComplexContent::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ComplexContent::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Concatenate every text block, ignoring non-text content.
pub fn extract_all_text(content: &[ComplexContent]) -> String {
    content
        .iter()
        .filter_map(ComplexContent::as_text)
        .collect::<Vec<_>>()
        .join("")
}
