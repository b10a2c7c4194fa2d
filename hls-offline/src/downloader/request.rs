//! Download request construction.

use serde::{Deserialize, Serialize};

use super::stream_key::StreamKey;

/// MIME type of an HLS master playlist.
pub const HLS_MIME_TYPE: &str = "application/x-mpegURL";

/// Request handed to the engine for one piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub content_id: String,
    pub source_url: String,
    pub mime_type: String,
    /// Selected streams. Empty means every rendition.
    pub stream_keys: Vec<StreamKey>,
}

impl DownloadRequest {
    /// Build an HLS download request.
    ///
    /// The URL is not validated here; the engine rejects malformed URIs on submission.
    pub fn build(
        content_id: impl Into<String>,
        source_url: impl Into<String>,
        stream_keys: Vec<StreamKey>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            source_url: source_url.into(),
            mime_type: HLS_MIME_TYPE.to_string(),
            stream_keys,
        }
    }

    /// Whether the request downloads every rendition.
    pub fn is_unrestricted(&self) -> bool {
        self.stream_keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_selection() {
        let request = DownloadRequest::build(
            "content-1",
            "https://cdn.example/master.m3u8",
            vec![StreamKey::new(0, 0, 2)],
        );
        assert_eq!(request.content_id, "content-1");
        assert_eq!(request.source_url, "https://cdn.example/master.m3u8");
        assert_eq!(request.mime_type, "application/x-mpegURL");
        assert_eq!(request.stream_keys, vec![StreamKey::new(0, 0, 2)]);
        assert!(!request.is_unrestricted());
    }

    #[test]
    fn test_build_without_selection_is_unrestricted() {
        let request = DownloadRequest::build("content-1", "https://cdn.example/master.m3u8", vec![]);
        assert!(request.is_unrestricted());
    }
}
