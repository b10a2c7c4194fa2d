//! Application-wide error types.

use thiserror::Error;

use crate::downloader::engine::EngineError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// A required work request field is missing or blank.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Invalid selection token `{token}`: {reason}")]
    Decode { token: String, reason: String },

    /// Manifest preparation failed before any rendition could be listed.
    #[error("Failed to prepare manifest {url}: {source}")]
    Preparation {
        url: String,
        #[source]
        source: EngineError,
    },

    /// The engine refused the download request. Fatal for the worker run.
    #[error("Engine rejected download {content_id}: {source}")]
    EngineSubmission {
        content_id: String,
        #[source]
        source: EngineError,
    },

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn decode(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
