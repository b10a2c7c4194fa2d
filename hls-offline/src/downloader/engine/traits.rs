//! Download engine capability traits and related types.
//!
//! The engine performs the actual segment fetching and storage. This crate
//! only drives it: submit a request, poll its state, issue pause/remove
//! commands, and prepare manifests for quality discovery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::downloader::request::DownloadRequest;

/// Errors reported by a download engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("download `{content_id}` conflicts with an existing download")]
    DuplicateId { content_id: String },

    #[error("invalid URI `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("request rejected: {reason}")]
    Rejected { reason: String },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("engine unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal engine error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Unavailable { .. } => true,
            Self::DuplicateId { .. }
            | Self::InvalidUri { .. }
            | Self::Rejected { .. }
            | Self::Manifest { .. }
            | Self::Cancelled
            | Self::Internal { .. } => false,
        }
    }
}

/// State of a download as tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Queued,
    Downloading,
    /// Stopped by a pause command; resumes when the request is re-submitted.
    Paused,
    Completed,
    Failed,
    Removing,
    Restarting,
}

/// Snapshot returned by [`DownloadEngine::query_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineDownload {
    pub state: EngineState,
    pub bytes_downloaded: u64,
    /// Total size, when the engine knows it.
    pub content_length: Option<u64>,
    /// Engine's own completion estimate in percent. May be out of range.
    pub percent_downloaded: f32,
}

impl EngineDownload {
    pub fn new(state: EngineState) -> Self {
        Self {
            state,
            bytes_downloaded: 0,
            content_length: None,
            percent_downloaded: 0.0,
        }
    }

    pub fn with_bytes(mut self, bytes_downloaded: u64, content_length: Option<u64>) -> Self {
        self.bytes_downloaded = bytes_downloaded;
        self.content_length = content_length;
        self
    }

    pub fn with_percent(mut self, percent: f32) -> Self {
        self.percent_downloaded = percent;
        self
    }

    /// Integer progress in `[0, 100]`.
    ///
    /// Uses the byte ratio when the content length is known and falls back to
    /// the engine's percentage estimate otherwise.
    pub fn progress_percent(&self) -> u8 {
        match self.content_length {
            Some(length) if length > 0 => {
                let ratio = (self.bytes_downloaded as u128 * 100) / length as u128;
                ratio.min(100) as u8
            }
            _ if self.percent_downloaded.is_nan() => 0,
            _ => self.percent_downloaded.clamp(0.0, 100.0) as u8,
        }
    }
}

/// Trait for download engines.
///
/// Implementations serialize their own per-id operations; callers do not
/// add locking around engine calls.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Hand a request to the engine.
    ///
    /// Submitting a request for an id the engine already tracks re-queues it
    /// with the new selection and clears a previous pause.
    async fn submit(&self, request: &DownloadRequest) -> Result<(), EngineError>;

    /// Resume all pending engine-managed downloads.
    async fn activate(&self);

    /// Current state of a download, or `None` if the engine does not know the id yet.
    async fn query_state(&self, content_id: &str) -> Result<Option<EngineDownload>, EngineError>;

    /// Stop a download without discarding its data.
    async fn pause(&self, content_id: &str);

    /// Stop a download and discard its data.
    async fn remove(&self, content_id: &str);
}

/// One selectable track inside a track group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackFormat {
    /// Vertical resolution, if the track is a video track with a known size.
    pub height: Option<u32>,
    pub width: Option<u32>,
    /// Declared peak bitrate in bits per second.
    pub bitrate: Option<u32>,
    pub codecs: Option<String>,
}

impl TrackFormat {
    pub fn video(width: u32, height: u32, bitrate: u32) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            bitrate: Some(bitrate),
            codecs: None,
        }
    }

    pub fn audio(bitrate: u32) -> Self {
        Self {
            bitrate: Some(bitrate),
            ..Self::default()
        }
    }
}

/// A group of interchangeable tracks (e.g. the video variants of a master playlist).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackGroup {
    pub tracks: Vec<TrackFormat>,
}

impl TrackGroup {
    pub fn new(tracks: Vec<TrackFormat>) -> Self {
        Self { tracks }
    }
}

/// A manifest prepared by the engine, holding engine resources until released.
pub trait PreparedManifest: Send {
    fn period_count(&self) -> usize;

    fn track_groups(&self, period_index: usize) -> &[TrackGroup];

    /// Release the engine resources. Called exactly once.
    fn release(&mut self);
}

/// Prepares manifests for quality discovery.
#[async_trait]
pub trait ManifestPreparer: Send + Sync {
    async fn prepare(&self, manifest_url: &str) -> Result<Box<dyn PreparedManifest>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_from_bytes() {
        let download = EngineDownload::new(EngineState::Downloading).with_bytes(50, Some(200));
        assert_eq!(download.progress_percent(), 25);
    }

    #[test]
    fn test_progress_falls_back_to_percent() {
        let download = EngineDownload::new(EngineState::Downloading)
            .with_bytes(50, None)
            .with_percent(42.7);
        assert_eq!(download.progress_percent(), 42);

        let zero_length = EngineDownload::new(EngineState::Downloading)
            .with_bytes(50, Some(0))
            .with_percent(13.0);
        assert_eq!(zero_length.progress_percent(), 13);
    }

    #[test]
    fn test_progress_is_clamped() {
        let over = EngineDownload::new(EngineState::Downloading).with_percent(180.0);
        assert_eq!(over.progress_percent(), 100);

        let under = EngineDownload::new(EngineState::Downloading).with_percent(-1.0);
        assert_eq!(under.progress_percent(), 0);

        let nan = EngineDownload::new(EngineState::Downloading).with_percent(f32::NAN);
        assert_eq!(nan.progress_percent(), 0);

        let bytes_over = EngineDownload::new(EngineState::Downloading).with_bytes(300, Some(200));
        assert_eq!(bytes_over.progress_percent(), 100);
    }

    #[test]
    fn test_engine_error_retryable() {
        assert!(EngineError::network("timeout").is_retryable());
        assert!(!EngineError::rejected("bad").is_retryable());
        assert!(
            !EngineError::DuplicateId {
                content_id: "1".to_string()
            }
            .is_retryable()
        );
    }
}
