//! Download record database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

/// Highest progress value a download may report before it completes.
pub const MAX_INCOMPLETE_PROGRESS: u8 = 99;

/// Download status values.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Requested, waiting for the engine to start.
    Queued,
    Downloading,
    /// Stopped by a pause command.
    Paused,
    Completed,
    Failed,
    /// Removed by the caller.
    Removed,
}

impl TryFrom<String> for DownloadStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

/// Persisted state of one download, keyed by content id.
///
/// `progress == 100` exactly when `status == Completed`, and the completion
/// timestamp and local path are set exactly then.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub content_id: String,
    #[sqlx(try_from = "String")]
    pub status: DownloadStatus,
    #[sqlx(try_from = "i64")]
    pub progress: u8,
    pub completed_at_ms: Option<i64>,
    pub local_path: Option<String>,
    pub title: Option<String>,
    pub season_id: Option<String>,
    pub season_name: Option<String>,
    pub thumbnail_url: Option<String>,
    pub season_thumbnail_url: Option<String>,
    /// Selection the download was requested with. `None` means every rendition.
    pub stream_keys: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Write counter, starting at 0 when the row is created.
    pub revision: i64,
}

impl DownloadRecord {
    /// A freshly requested download.
    pub fn queued(content_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            content_id: content_id.into(),
            status: DownloadStatus::Queued,
            progress: 0,
            completed_at_ms: None,
            local_path: None,
            title: None,
            season_id: None,
            season_name: None,
            thumbnail_url: None,
            season_thumbnail_url: None,
            stream_keys: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            revision: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == DownloadStatus::Completed
    }

    /// Apply a progress update in place.
    pub fn apply(&mut self, update: &ProgressUpdate, now_ms: i64) {
        self.status = update.status;
        self.progress = update.progress;
        self.completed_at_ms = update.completed_at_ms;
        self.local_path = update.local_path.clone();
        self.updated_at_ms = now_ms;
    }

    /// Apply a status change in place, keeping the completion invariant.
    pub fn apply_status(&mut self, status: DownloadStatus, now_ms: i64) {
        self.status = status;
        self.progress = self.progress.min(MAX_INCOMPLETE_PROGRESS);
        self.completed_at_ms = None;
        self.local_path = None;
        self.updated_at_ms = now_ms;
    }
}

/// A status/progress write produced by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub content_id: String,
    pub status: DownloadStatus,
    pub progress: u8,
    pub completed_at_ms: Option<i64>,
    pub local_path: Option<String>,
}

impl ProgressUpdate {
    /// Progress is capped at 99; only completion reports 100.
    pub fn downloading(content_id: impl Into<String>, progress: u8) -> Self {
        Self::incomplete(content_id, DownloadStatus::Downloading, progress)
    }

    pub fn paused(content_id: impl Into<String>, progress: u8) -> Self {
        Self::incomplete(content_id, DownloadStatus::Paused, progress)
    }

    pub fn failed(content_id: impl Into<String>, progress: u8) -> Self {
        Self::incomplete(content_id, DownloadStatus::Failed, progress)
    }

    pub fn completed(
        content_id: impl Into<String>,
        completed_at_ms: i64,
        local_path: impl Into<String>,
    ) -> Self {
        Self {
            content_id: content_id.into(),
            status: DownloadStatus::Completed,
            progress: 100,
            completed_at_ms: Some(completed_at_ms),
            local_path: Some(local_path.into()),
        }
    }

    fn incomplete(content_id: impl Into<String>, status: DownloadStatus, progress: u8) -> Self {
        Self {
            content_id: content_id.into(),
            status,
            progress: progress.min(MAX_INCOMPLETE_PROGRESS),
            completed_at_ms: None,
            local_path: None,
        }
    }

    /// Check the completion invariant before writing.
    pub fn validate(&self) -> Result<()> {
        let completed = self.status == DownloadStatus::Completed;
        let consistent = completed == (self.progress == 100)
            && completed == self.completed_at_ms.is_some()
            && completed == self.local_path.is_some()
            && self.progress <= 100;
        if consistent {
            Ok(())
        } else {
            Err(Error::invalid_input(format!(
                "inconsistent progress update for {}: status={} progress={}",
                self.content_id, self.status, self.progress
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            DownloadStatus::Queued,
            DownloadStatus::Downloading,
            DownloadStatus::Paused,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Removed,
        ] {
            let name: &'static str = status.into();
            assert_eq!(status.to_string(), name);
            assert_eq!(name.parse::<DownloadStatus>().unwrap(), status);
        }
        assert!("finished".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn test_incomplete_updates_cap_progress() {
        let update = ProgressUpdate::downloading("a", 100);
        assert_eq!(update.progress, 99);
        assert!(update.validate().is_ok());

        let paused = ProgressUpdate::paused("a", 40);
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert!(paused.validate().is_ok());
    }

    #[test]
    fn test_completed_update_is_consistent() {
        let update = ProgressUpdate::completed("a", 1_700_000_000_000, "/data/a");
        assert_eq!(update.progress, 100);
        assert!(update.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_update() {
        let mut update = ProgressUpdate::downloading("a", 10);
        update.local_path = Some("/data/a".to_string());
        assert!(update.validate().is_err());

        let mut done = ProgressUpdate::completed("a", 1, "/data/a");
        done.progress = 90;
        assert!(done.validate().is_err());
    }

    #[test]
    fn test_apply_status_clears_completion() {
        let mut record = DownloadRecord::queued("a", 1);
        record.apply(&ProgressUpdate::completed("a", 5, "/data/a"), 5);
        assert!(record.is_completed());

        record.apply_status(DownloadStatus::Failed, 6);
        assert_eq!(record.progress, 99);
        assert_eq!(record.completed_at_ms, None);
        assert_eq!(record.local_path, None);
        assert_eq!(record.status, DownloadStatus::Failed);
    }
}
