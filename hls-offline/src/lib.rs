//! hls-offline library crate.
//!
//! Background download orchestration for offline HLS playback: quality
//! discovery, selection encoding, worker scheduling and a persisted,
//! observable download store.

pub mod config;
pub mod database;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod testing;

pub use error::{Error, Result};
