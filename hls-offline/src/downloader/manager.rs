//! Download service: the control API over workers, engine and store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::engine::{DownloadEngine, ManifestPreparer};
use super::progress::ProgressStore;
use super::quality::{self, Rendition};
use super::stream_key::StreamKey;
use super::worker::{DownloadWorker, WorkerConfig, WorkerInput, WorkerOutcome};
use crate::database::models::DownloadRecord;
use crate::database::repositories::DownloadRepository;
use crate::{Error, Result};

/// Configuration for the download service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadServiceConfig {
    pub worker: WorkerConfig,
    /// Maximum number of workers driving the engine at once.
    pub max_concurrent_downloads: usize,
    /// Buffered record snapshots per subscriber.
    pub event_channel_capacity: usize,
}

impl Default for DownloadServiceConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            max_concurrent_downloads: 3,
            event_channel_capacity: 256,
        }
    }
}

/// A piece of content the caller wants available offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub content_id: String,
    pub hls_url: String,
    pub title: Option<String>,
    pub season_id: Option<String>,
    pub season_name: Option<String>,
    pub thumbnail_url: Option<String>,
    pub season_thumbnail_url: Option<String>,
}

impl DownloadItem {
    pub fn new(content_id: impl Into<String>, hls_url: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            hls_url: hls_url.into(),
            title: None,
            season_id: None,
            season_name: None,
            thumbnail_url: None,
            season_thumbnail_url: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_season(mut self, season_id: impl Into<String>, season_name: impl Into<String>) -> Self {
        self.season_id = Some(season_id.into());
        self.season_name = Some(season_name.into());
        self
    }

    pub fn with_thumbnails(
        mut self,
        thumbnail_url: Option<String>,
        season_thumbnail_url: Option<String>,
    ) -> Self {
        self.thumbnail_url = thumbnail_url;
        self.season_thumbnail_url = season_thumbnail_url;
        self
    }

    fn worker_input(&self, stream_keys: Option<String>) -> WorkerInput {
        WorkerInput {
            hls_uri: Some(self.hls_url.clone()),
            content_id: Some(self.content_id.clone()),
            stream_keys,
            content_title: self.title.clone(),
            season_id: self.season_id.clone(),
            season_name: self.season_name.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
            season_thumbnail_url: self.season_thumbnail_url.clone(),
        }
    }
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A worker was scheduled.
    Started,
    /// A worker for the id is already running; nothing was changed.
    AlreadyActive,
    /// The content is already downloaded; nothing was changed.
    AlreadyCompleted,
}

/// Result of a resume request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The running worker's request was handed to the engine again.
    Resubmitted,
    /// No worker was running; a new one was scheduled.
    Restarted,
    /// The worker is still waiting for a slot and submits the request once
    /// it gets one; the engine was not touched.
    Waiting,
    /// A cancel for the id is still in progress; nothing was changed.
    Cancelling,
    AlreadyCompleted,
}

/// Internal state for an active download.
///
/// The entry keeps the id reserved until the worker has stopped, including
/// while a cancel or shutdown is waiting for it.
struct ActiveDownload {
    generation: u64,
    input: WorkerInput,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    /// Set once the worker holds a concurrency slot.
    running: Arc<AtomicBool>,
    /// Set by cancel or shutdown; the stopping side releases the entry.
    stopping: bool,
    started_at: DateTime<Utc>,
}

/// Snapshot of an active download for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDownloadInfo {
    pub content_id: String,
    pub stream_keys: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Schedules and controls download workers.
///
/// At most one worker runs per content id. The worker is the only writer of
/// status and progress; the service only creates the initial record.
pub struct DownloadService {
    config: DownloadServiceConfig,
    engine: Arc<dyn DownloadEngine>,
    preparer: Arc<dyn ManifestPreparer>,
    store: ProgressStore,
    clock: Arc<dyn Clock>,
    worker: Arc<DownloadWorker>,
    semaphore: Arc<Semaphore>,
    active: Arc<DashMap<String, ActiveDownload>>,
    generations: AtomicU64,
}

impl DownloadService {
    pub fn new(
        config: DownloadServiceConfig,
        engine: Arc<dyn DownloadEngine>,
        preparer: Arc<dyn ManifestPreparer>,
        repo: Arc<dyn DownloadRepository>,
    ) -> Self {
        let store = ProgressStore::new(repo, config.event_channel_capacity);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let worker = Arc::new(DownloadWorker::new(
            engine.clone(),
            store.clone(),
            clock.clone(),
            config.worker.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));

        Self {
            config,
            engine,
            preparer,
            store,
            clock,
            worker,
            semaphore,
            active: Arc::new(DashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Replace the time source used by workers.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.worker = Arc::new(DownloadWorker::new(
            self.engine.clone(),
            self.store.clone(),
            clock.clone(),
            self.config.worker.clone(),
        ));
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DownloadServiceConfig {
        &self.config
    }

    /// List the distinct video renditions of a master playlist.
    pub async fn discover_qualities(&self, manifest_url: &str) -> Result<Vec<Rendition>> {
        quality::discover_qualities(self.preparer.as_ref(), manifest_url).await
    }

    /// Start downloading a single rendition.
    pub async fn start_download_with_quality(
        &self,
        item: &DownloadItem,
        rendition: &Rendition,
    ) -> Result<StartOutcome> {
        self.start_download(item, &[rendition.stream_key]).await
    }

    /// Start downloading the given selection. An empty selection downloads
    /// every rendition.
    pub async fn start_download(
        &self,
        item: &DownloadItem,
        stream_keys: &[StreamKey],
    ) -> Result<StartOutcome> {
        let input = item.worker_input(None).with_stream_keys(stream_keys)?;
        input.to_request()?;

        let outcome = self.schedule(&item.content_id, input).await?;
        match outcome {
            StartOutcome::Started => info!(
                content_id = %item.content_id,
                selection = stream_keys.len(),
                "Download scheduled"
            ),
            StartOutcome::AlreadyActive => {
                debug!(content_id = %item.content_id, "Download already active")
            }
            StartOutcome::AlreadyCompleted => {
                debug!(content_id = %item.content_id, "Download already completed")
            }
        }
        Ok(outcome)
    }

    /// Ask the engine to pause. The worker persists the paused state once
    /// the engine reports it.
    pub async fn pause_download(&self, content_id: &str) {
        info!(content_id = %content_id, "Pausing download");
        self.engine.pause(content_id).await;
    }

    /// Continue a paused or interrupted download with its stored selection.
    pub async fn resume_download(&self, item: &DownloadItem) -> Result<ResumeOutcome> {
        let running = match self.active.get(&item.content_id) {
            Some(active) if active.stopping => {
                debug!(content_id = %item.content_id, "Resume ignored, cancel in progress");
                return Ok(ResumeOutcome::Cancelling);
            }
            Some(active) if !active.running.load(Ordering::SeqCst) => {
                debug!(content_id = %item.content_id, "Worker still waiting for a slot");
                return Ok(ResumeOutcome::Waiting);
            }
            Some(active) => Some(active.input.clone()),
            None => None,
        };

        if let Some(input) = running {
            let request = input.to_request()?;
            self.engine
                .submit(&request)
                .await
                .map_err(|source| Error::EngineSubmission {
                    content_id: item.content_id.clone(),
                    source,
                })?;
            self.engine.activate().await;
            info!(content_id = %item.content_id, "Download resubmitted");
            return Ok(ResumeOutcome::Resubmitted);
        }

        let stored = self.store.get(&item.content_id).await?;
        let stream_keys = stored.as_ref().and_then(|r| r.stream_keys.clone());
        let input = item.worker_input(stream_keys);
        input.to_request()?;

        let outcome = match self.schedule(&item.content_id, input).await? {
            StartOutcome::Started => ResumeOutcome::Restarted,
            // Another caller started it concurrently.
            StartOutcome::AlreadyActive => ResumeOutcome::Resubmitted,
            StartOutcome::AlreadyCompleted => ResumeOutcome::AlreadyCompleted,
        };
        info!(content_id = %item.content_id, ?outcome, "Download resumed");
        Ok(outcome)
    }

    /// Stop the worker and remove the download from the engine.
    ///
    /// The id stays reserved until the worker has exited, so a start or
    /// resume issued meanwhile does not schedule a second worker. The record
    /// keeps the last state the worker wrote. Returns `true` if a worker was
    /// running or already being cancelled.
    pub async fn cancel_download(&self, content_id: &str) -> bool {
        let claimed = match self.active.get_mut(content_id) {
            Some(active) if active.stopping => {
                debug!(content_id = %content_id, "Cancel already in progress");
                return true;
            }
            Some(mut active) => {
                active.stopping = true;
                active.cancel.cancel();
                Some((active.generation, active.task.take()))
            }
            None => None,
        };

        info!(content_id = %content_id, "Cancelling download");
        self.engine.remove(content_id).await;

        let Some((generation, task)) = claimed else {
            return false;
        };
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(content_id = %content_id, error = %e, "Download worker panicked");
        }
        self.release(content_id, generation);
        true
    }

    /// Record snapshots for one content id: the stored state, then every change.
    pub fn observe(&self, content_id: impl Into<String>) -> BoxStream<'static, DownloadRecord> {
        self.store.observe(content_id)
    }

    /// Every published record snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadRecord> {
        self.store.subscribe()
    }

    pub async fn get_download(&self, content_id: &str) -> Result<Option<DownloadRecord>> {
        self.store.get(content_id).await
    }

    pub async fn list_downloads(&self) -> Result<Vec<DownloadRecord>> {
        self.store.repository().list_all().await
    }

    pub fn is_active(&self, content_id: &str) -> bool {
        self.active.contains_key(content_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_downloads(&self) -> Vec<ActiveDownloadInfo> {
        self.active
            .iter()
            .map(|entry| ActiveDownloadInfo {
                content_id: entry.key().clone(),
                stream_keys: entry.input.stream_keys.clone(),
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Cancel every worker and wait for them to stop.
    pub async fn shutdown(&self) {
        let mut stopping = Vec::new();
        for mut active in self.active.iter_mut() {
            if active.stopping {
                continue;
            }
            active.stopping = true;
            active.cancel.cancel();
            let task = active.task.take();
            stopping.push((active.key().clone(), active.generation, task));
        }
        info!(count = stopping.len(), "Shutting down download service");

        for (id, generation, task) in stopping {
            if let Some(task) = task
                && let Err(e) = task.await
            {
                error!(content_id = %id, error = %e, "Download worker panicked");
            }
            self.release(&id, generation);
        }
    }

    /// Reserve the id, create the record if needed and spawn the worker.
    async fn schedule(&self, content_id: &str, input: WorkerInput) -> Result<StartOutcome> {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(false));

        match self.active.entry(content_id.to_string()) {
            Entry::Occupied(_) => return Ok(StartOutcome::AlreadyActive),
            Entry::Vacant(slot) => {
                slot.insert(ActiveDownload {
                    generation,
                    input: input.clone(),
                    cancel: cancel.clone(),
                    task: None,
                    running: running.clone(),
                    stopping: false,
                    started_at: Utc::now(),
                });
            }
        }

        match self.prepare_record(content_id, &input).await {
            Ok(true) => {}
            Ok(false) => {
                self.abandon(content_id, generation);
                return Ok(StartOutcome::AlreadyCompleted);
            }
            Err(e) => {
                self.abandon(content_id, generation);
                return Err(e);
            }
        }

        if cancel.is_cancelled() {
            debug!(content_id = %content_id, "Cancelled before the worker was spawned");
            return Ok(StartOutcome::Started);
        }

        let task = self.spawn_worker(content_id.to_string(), generation, input, cancel, running);
        if let Some(mut active) = self.active.get_mut(content_id)
            && active.generation == generation
            && !active.stopping
        {
            active.task = Some(task);
        }
        Ok(StartOutcome::Started)
    }

    /// Create the `queued` record if absent. Returns `false` if the content
    /// is already downloaded.
    async fn prepare_record(&self, content_id: &str, input: &WorkerInput) -> Result<bool> {
        if let Some(existing) = self.store.get(content_id).await? {
            return Ok(!existing.is_completed());
        }

        let record = input.queued_record(content_id, self.clock.now_ms());
        if self.store.create_if_absent(&record).await? {
            debug!(content_id = %content_id, "Created download record");
        }
        Ok(true)
    }

    fn release(&self, content_id: &str, generation: u64) {
        self.active
            .remove_if(content_id, |_, active| active.generation == generation);
    }

    /// Drop a reservation that never got a worker, unless a cancel owns it.
    fn abandon(&self, content_id: &str, generation: u64) {
        self.active.remove_if(content_id, |_, active| {
            active.generation == generation && !active.stopping
        });
    }

    fn spawn_worker(
        &self,
        content_id: String,
        generation: u64,
        input: WorkerInput,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let worker = self.worker.clone();
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = semaphore.acquire_owned() => permit.ok(),
            };

            if let Some(_permit) = permit {
                running.store(true, Ordering::SeqCst);
                match worker.run(&input, &cancel).await {
                    Ok(WorkerOutcome::Completed { local_path }) => {
                        info!(content_id = %content_id, path = %local_path, "Worker finished");
                    }
                    Ok(WorkerOutcome::Failed) => {
                        warn!(content_id = %content_id, "Worker finished with a failed download");
                    }
                    Ok(WorkerOutcome::Cancelled) => {
                        debug!(content_id = %content_id, "Worker stopped");
                    }
                    Err(e) => {
                        error!(content_id = %content_id, error = %e, "Worker failed");
                    }
                }
            } else {
                debug!(content_id = %content_id, "Worker cancelled while waiting for a slot");
            }

            // A stopping entry is released by the side that stopped it.
            active.remove_if(&content_id, |_, a| a.generation == generation && !a.stopping);
        })
    }
}
