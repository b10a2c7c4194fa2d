//! Download engine abstraction.
//!
//! The engine is an external black box; this module defines the capability
//! surface the orchestrator drives.

mod callback;
mod traits;

pub use callback::{CallbackAdapter, CallbackPreparer, PrepareCallback};
pub use traits::{
    DownloadEngine, EngineDownload, EngineError, EngineState, ManifestPreparer, PreparedManifest,
    TrackFormat, TrackGroup,
};
