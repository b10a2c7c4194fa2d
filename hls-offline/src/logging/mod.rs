//! Logging setup: env-driven filter that can be changed at runtime, local
//! timestamps, console output and an optional daily rolling log file.

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "hls_offline=info,sqlx=warn";

/// Rolling log file name prefix.
pub const LOG_FILE_PREFIX: &str = "hls-offline.log";

/// Formats timestamps in the local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct Logging {
    handle: FilterHandle,
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl Logging {
    /// Current filter directive.
    pub fn filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `hls_offline=debug`.
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Other(format!("Failed to reload filter: {e}")))?;
        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| Error::config(format!("Invalid filter directive `{directive}`: {e}")))
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `filter`, which wins over [`DEFAULT_LOG_FILTER`].
/// When `log_dir` is set, logs are also written to a daily rolling file
/// there. Keep the returned value alive so buffered file output is flushed.
pub fn init_logging(filter: Option<&str>, log_dir: Option<&Path>) -> Result<Logging> {
    let initial_filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => parse_filter(filter.unwrap_or(DEFAULT_LOG_FILTER))?,
    };
    let (filter_layer, handle) = reload::Layer::new(initial_filter);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok(Logging {
        handle,
        log_dir: log_dir.map(Path::to_path_buf),
        _guard: guard,
    })
}
