//! Download orchestration.
//!
//! Quality discovery turns a master playlist into selectable renditions, the
//! [`DownloadService`] schedules one [`DownloadWorker`] per content id, and
//! each worker mirrors the engine's state into the download store.

pub mod clock;
pub mod engine;
pub mod manager;
pub mod progress;
pub mod quality;
pub mod request;
pub mod stream_key;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use engine::{
    CallbackAdapter, CallbackPreparer, DownloadEngine, EngineDownload, EngineError, EngineState,
    ManifestPreparer, PrepareCallback, PreparedManifest, TrackFormat, TrackGroup,
};
pub use manager::{
    ActiveDownloadInfo, DownloadItem, DownloadService, DownloadServiceConfig, ResumeOutcome,
    StartOutcome,
};
pub use progress::ProgressStore;
pub use quality::{Rendition, discover_qualities};
pub use request::{DownloadRequest, HLS_MIME_TYPE};
pub use stream_key::StreamKey;
pub use worker::{DownloadWorker, WorkerConfig, WorkerInput, WorkerOutcome};
