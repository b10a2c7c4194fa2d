//! Background download worker.
//!
//! One worker drives one content id: it submits the request to the engine,
//! polls the engine state and mirrors it into the download store until the
//! download completes, fails or the worker is cancelled.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::engine::{DownloadEngine, EngineDownload, EngineState};
use super::progress::ProgressStore;
use super::request::DownloadRequest;
use super::stream_key::{self, StreamKey};
use crate::database::models::{
    DownloadRecord, DownloadStatus, MAX_INCOMPLETE_PROGRESS, ProgressUpdate,
};
use crate::{Error, Result};

/// Worker timing and output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delay between engine polls while the engine knows the download.
    pub poll_interval_ms: u64,
    /// Delay before retrying when the engine does not know the id yet.
    pub not_found_interval_ms: u64,
    /// Directory the engine stores completed content under.
    pub download_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            not_found_interval_ms: 500,
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn not_found_interval(&self) -> Duration {
        Duration::from_millis(self.not_found_interval_ms)
    }

    /// Where a completed download is recorded as living.
    pub fn local_path(&self, content_id: &str) -> String {
        self.download_dir
            .join(content_id)
            .to_string_lossy()
            .into_owned()
    }
}

/// Serializable work request handed to a worker.
///
/// Every field is optional on the wire; `run` validates what it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInput {
    pub hls_uri: Option<String>,
    pub content_id: Option<String>,
    /// Selection token, see [`stream_key::encode`]. Absent means every rendition.
    pub stream_keys: Option<String>,
    pub content_title: Option<String>,
    pub season_id: Option<String>,
    pub season_name: Option<String>,
    pub thumbnail_url: Option<String>,
    pub season_thumbnail_url: Option<String>,
}

impl WorkerInput {
    pub fn new(content_id: impl Into<String>, hls_uri: impl Into<String>) -> Self {
        Self {
            hls_uri: Some(hls_uri.into()),
            content_id: Some(content_id.into()),
            ..Self::default()
        }
    }

    /// Restrict the download to `keys`. An empty slice leaves it unrestricted.
    pub fn with_stream_keys(mut self, keys: &[StreamKey]) -> Result<Self> {
        self.stream_keys = if keys.is_empty() {
            None
        } else {
            Some(stream_key::encode(keys)?)
        };
        Ok(self)
    }

    /// The initial `queued` record for this request, carrying its metadata.
    pub fn queued_record(&self, content_id: &str, now_ms: i64) -> DownloadRecord {
        DownloadRecord {
            title: self.content_title.clone(),
            season_id: self.season_id.clone(),
            season_name: self.season_name.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            season_thumbnail_url: self.season_thumbnail_url.clone(),
            stream_keys: self.stream_keys.clone(),
            ..DownloadRecord::queued(content_id, now_ms)
        }
    }

    /// Build the engine request after validating the required fields.
    pub fn to_request(&self) -> Result<DownloadRequest> {
        let content_id = required(self.content_id.as_deref(), "content_id")?;
        let hls_uri = required(self.hls_uri.as_deref(), "hls_uri")?;
        let keys = match self.stream_keys.as_deref() {
            Some(token) if !token.is_empty() => stream_key::decode(token)?,
            _ => Vec::new(),
        };
        Ok(DownloadRequest::build(content_id, hls_uri, keys))
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(Error::invalid_input(format!("missing {field}"))),
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed { local_path: String },
    Failed,
    Cancelled,
}

/// Tracks what was last written so unchanged polls are not persisted.
///
/// Progress never moves backwards while a download is incomplete and stays
/// below 100 until completion.
#[derive(Debug, Clone, Default)]
struct ProgressTracker {
    last: Option<(DownloadStatus, u8)>,
    floor: u8,
}

impl ProgressTracker {
    fn resume_from(record: Option<&DownloadRecord>) -> Self {
        match record {
            Some(r) if matches!(r.status, DownloadStatus::Downloading | DownloadStatus::Paused) => {
                Self {
                    last: Some((r.status, r.progress)),
                    floor: r.progress.min(MAX_INCOMPLETE_PROGRESS),
                }
            }
            Some(r) => Self {
                last: Some((r.status, r.progress)),
                floor: 0,
            },
            None => Self::default(),
        }
    }

    /// Returns the progress to write, or `None` if nothing changed.
    fn observe(&mut self, status: DownloadStatus, raw_progress: u8) -> Option<u8> {
        let progress = raw_progress.min(MAX_INCOMPLETE_PROGRESS).max(self.floor);
        if self.last == Some((status, progress)) {
            return None;
        }
        self.floor = progress;
        self.last = Some((status, progress));
        Some(progress)
    }

    fn progress(&self) -> u8 {
        self.floor
    }
}

/// Drives one download through the engine and mirrors it into the store.
pub struct DownloadWorker {
    engine: Arc<dyn DownloadEngine>,
    store: ProgressStore,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl DownloadWorker {
    pub fn new(
        engine: Arc<dyn DownloadEngine>,
        store: ProgressStore,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            engine,
            store,
            clock,
            config,
        }
    }

    /// Run the download until it completes, fails or `cancel` fires.
    ///
    /// Submission errors mark an existing record `failed` and are returned
    /// without polling. Store errors abort the run. Nothing is written when
    /// the run is cancelled.
    pub async fn run(&self, input: &WorkerInput, cancel: &CancellationToken) -> Result<WorkerOutcome> {
        let request = input.to_request()?;
        let content_id = request.content_id.as_str();

        if cancel.is_cancelled() {
            return Ok(WorkerOutcome::Cancelled);
        }

        info!(
            content_id = %content_id,
            selection = request.stream_keys.len(),
            "Submitting download"
        );
        if let Err(source) = self.engine.submit(&request).await {
            error!(content_id = %content_id, error = %source, "Engine rejected download");
            if let Err(e) = self.store.publish_status(content_id, DownloadStatus::Failed).await {
                warn!(content_id = %content_id, error = %e, "Failed to mark download as failed");
            }
            return Err(Error::EngineSubmission {
                content_id: content_id.to_string(),
                source,
            });
        }
        self.engine.activate().await;

        let existing = self.store.get(content_id).await?;
        let mut tracker = ProgressTracker::resume_from(existing.as_ref());

        loop {
            if cancel.is_cancelled() {
                debug!(content_id = %content_id, "Worker cancelled");
                return Ok(WorkerOutcome::Cancelled);
            }

            let wait = match self.engine.query_state(content_id).await {
                Ok(Some(download)) => {
                    if let Some(outcome) = self.handle_state(content_id, &download, &mut tracker).await? {
                        return Ok(outcome);
                    }
                    self.config.poll_interval()
                }
                Ok(None) => {
                    debug!(content_id = %content_id, "Download not known to engine yet");
                    self.config.not_found_interval()
                }
                Err(e) if e.is_retryable() => {
                    debug!(content_id = %content_id, error = %e, "Engine state lookup failed, retrying");
                    self.config.not_found_interval()
                }
                Err(e) => {
                    warn!(content_id = %content_id, error = %e, "Engine state lookup failed");
                    self.config.not_found_interval()
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(content_id = %content_id, "Worker cancelled");
                    return Ok(WorkerOutcome::Cancelled);
                }
                _ = self.clock.sleep(wait) => {}
            }
        }
    }

    async fn handle_state(
        &self,
        content_id: &str,
        download: &EngineDownload,
        tracker: &mut ProgressTracker,
    ) -> Result<Option<WorkerOutcome>> {
        match download.state {
            EngineState::Downloading => {
                if let Some(progress) =
                    tracker.observe(DownloadStatus::Downloading, download.progress_percent())
                {
                    debug!(content_id = %content_id, progress, "Download progress");
                    self.store
                        .publish(&ProgressUpdate::downloading(content_id, progress))
                        .await?;
                }
                Ok(None)
            }
            EngineState::Paused => {
                if let Some(progress) =
                    tracker.observe(DownloadStatus::Paused, download.progress_percent())
                {
                    info!(content_id = %content_id, progress, "Download paused");
                    self.store
                        .publish(&ProgressUpdate::paused(content_id, progress))
                        .await?;
                }
                Ok(None)
            }
            EngineState::Completed => {
                let local_path = self.config.local_path(content_id);
                self.store
                    .publish(&ProgressUpdate::completed(
                        content_id,
                        self.clock.now_ms(),
                        local_path.clone(),
                    ))
                    .await?;
                info!(content_id = %content_id, path = %local_path, "Download completed");
                Ok(Some(WorkerOutcome::Completed { local_path }))
            }
            EngineState::Failed => {
                self.store
                    .publish(&ProgressUpdate::failed(content_id, tracker.progress()))
                    .await?;
                warn!(content_id = %content_id, "Engine reported download failure");
                Ok(Some(WorkerOutcome::Failed))
            }
            EngineState::Queued | EngineState::Removing | EngineState::Restarting => Ok(None),
        }
    }
}
