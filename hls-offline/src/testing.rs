//! Test fakes for the engine, manifest preparation and time.
//!
//! Used by the unit tests of this crate and by integration tests; nothing in
//! here touches the network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::downloader::clock::Clock;
use crate::downloader::engine::{
    DownloadEngine, EngineDownload, EngineError, EngineState, ManifestPreparer, PreparedManifest,
    TrackFormat, TrackGroup,
};
use crate::downloader::request::DownloadRequest;

/// Initialize tracing for tests with appropriate settings
#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Shorthand for an engine snapshot in the downloading state.
pub fn downloading(bytes_downloaded: u64, content_length: u64) -> Option<EngineDownload> {
    Some(EngineDownload::new(EngineState::Downloading).with_bytes(bytes_downloaded, Some(content_length)))
}

/// Shorthand for an engine snapshot in a state without byte counts.
pub fn state(state: EngineState) -> Option<EngineDownload> {
    Some(EngineDownload::new(state))
}

#[derive(Default)]
struct ScriptState {
    /// Remaining per-poll answers for each id.
    scripts: HashMap<String, VecDeque<Option<EngineDownload>>>,
    /// Last answer per id, repeated once the script runs dry.
    last: HashMap<String, Option<EngineDownload>>,
    paused: HashSet<String>,
    removed: HashSet<String>,
    submitted: Vec<DownloadRequest>,
}

/// Engine whose `query_state` answers come from a per-id script.
///
/// Each poll consumes one scripted answer; the final answer repeats forever.
/// Ids without a script are reported as unknown. A `pause` makes subsequent
/// polls report `Paused` until the request is submitted again; a `remove`
/// makes the id unknown.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Mutex<ScriptState>,
    submit_error: Mutex<Option<EngineError>>,
    query_errors: Mutex<VecDeque<EngineError>>,
    submits: AtomicUsize,
    activations: AtomicUsize,
    queries: AtomicUsize,
    pauses: AtomicUsize,
    removals: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, content_id: &str, answers: Vec<Option<EngineDownload>>) -> Self {
        self.push_script(content_id, answers);
        self
    }

    /// Make every `submit` fail with `error`.
    pub fn rejecting(self, error: EngineError) -> Self {
        *self.submit_error.lock() = Some(error);
        self
    }

    /// Fail the next `query_state` calls with `errors`, in order, before
    /// any scripted answer is consumed.
    pub fn with_query_errors(self, errors: Vec<EngineError>) -> Self {
        self.query_errors.lock().extend(errors);
        self
    }

    /// Append answers to the script of `content_id`.
    pub fn push_script(&self, content_id: &str, answers: Vec<Option<EngineDownload>>) {
        self.state
            .lock()
            .scripts
            .entry(content_id.to_string())
            .or_default()
            .extend(answers);
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn activate_count(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn pause_count(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    /// Requests accepted so far, in submission order.
    pub fn submitted(&self) -> Vec<DownloadRequest> {
        self.state.lock().submitted.clone()
    }
}

#[async_trait]
impl DownloadEngine for ScriptedEngine {
    async fn submit(&self, request: &DownloadRequest) -> Result<(), EngineError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.submit_error.lock().clone() {
            return Err(error);
        }

        let mut state = self.state.lock();
        state.paused.remove(&request.content_id);
        state.removed.remove(&request.content_id);
        state.submitted.push(request.clone());
        Ok(())
    }

    async fn activate(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    async fn query_state(&self, content_id: &str) -> Result<Option<EngineDownload>, EngineError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.query_errors.lock().pop_front() {
            return Err(error);
        }
        let mut state = self.state.lock();

        if state.removed.contains(content_id) {
            return Ok(None);
        }

        if state.paused.contains(content_id) {
            let mut snapshot = state
                .last
                .get(content_id)
                .cloned()
                .flatten()
                .unwrap_or_else(|| EngineDownload::new(EngineState::Paused));
            snapshot.state = EngineState::Paused;
            return Ok(Some(snapshot));
        }

        let next = state
            .scripts
            .get_mut(content_id)
            .and_then(|script| script.pop_front());
        let answer = match next {
            Some(answer) => {
                state.last.insert(content_id.to_string(), answer.clone());
                answer
            }
            None => state.last.get(content_id).cloned().flatten(),
        };
        Ok(answer)
    }

    async fn pause(&self, content_id: &str) {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        self.state.lock().paused.insert(content_id.to_string());
    }

    async fn remove(&self, content_id: &str) {
        self.removals.fetch_add(1, Ordering::SeqCst);
        self.state.lock().removed.insert(content_id.to_string());
    }
}

/// In-memory manifest with fixed track groups.
#[derive(Debug, Clone, Default)]
pub struct StaticManifest {
    periods: Vec<Vec<TrackGroup>>,
    release_counter: Option<Arc<AtomicUsize>>,
}

impl StaticManifest {
    /// Periods, each holding its track groups.
    pub fn new(periods: Vec<Vec<TrackGroup>>) -> Self {
        Self {
            periods,
            release_counter: None,
        }
    }

    /// A single period; each slice becomes one group of 16:9 video tracks.
    pub fn from_heights(groups: &[&[u32]]) -> Self {
        let groups = groups
            .iter()
            .map(|heights| {
                TrackGroup::new(
                    heights
                        .iter()
                        .map(|&h| TrackFormat::video(h * 16 / 9, h, h.saturating_mul(2_000)))
                        .collect(),
                )
            })
            .collect();
        Self::new(vec![groups])
    }

    /// Count `release` calls into `counter`.
    pub fn with_release_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.release_counter = Some(counter);
        self
    }
}

impl PreparedManifest for StaticManifest {
    fn period_count(&self) -> usize {
        self.periods.len()
    }

    fn track_groups(&self, period_index: usize) -> &[TrackGroup] {
        self.periods
            .get(period_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn release(&mut self) {
        if let Some(counter) = &self.release_counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Preparer that hands out clones of one manifest, or always fails.
pub struct StaticManifestPreparer {
    result: Result<StaticManifest, EngineError>,
}

impl StaticManifestPreparer {
    pub fn new(manifest: StaticManifest) -> Self {
        Self {
            result: Ok(manifest),
        }
    }

    pub fn failing(error: EngineError) -> Self {
        Self { result: Err(error) }
    }
}

#[async_trait]
impl ManifestPreparer for StaticManifestPreparer {
    async fn prepare(&self, _manifest_url: &str) -> Result<Box<dyn PreparedManifest>, EngineError> {
        match &self.result {
            Ok(manifest) => Ok(Box::new(manifest.clone())),
            Err(error) => Err(error.clone()),
        }
    }
}

/// Virtual clock: sleeping advances time instantly and yields to the runtime.
#[derive(Debug)]
pub struct InstantClock {
    now_ms: AtomicI64,
    sleeps: AtomicUsize,
}

impl InstantClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
            sleeps: AtomicUsize::new(0),
        }
    }

    pub fn sleep_count(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Default for InstantClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

#[async_trait]
impl Clock for InstantClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::SeqCst);
        self.now_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
        tokio::task::yield_now().await;
    }
}
