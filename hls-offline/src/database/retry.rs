//! Retry helpers for store writes.
//!
//! Progress writes from many workers share one SQLite write connection, so
//! `SQLITE_BUSY`/`SQLITE_LOCKED` are retried with capped, jittered
//! exponential backoff. Any other error is returned immediately.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 8;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 1_000;

/// SQLite primary result codes for a busy or locked database.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

fn is_busy(err: &Error) -> bool {
    let Error::Persistence(sqlx_err) = err else {
        return false;
    };

    if let sqlx::Error::Database(db_err) = sqlx_err
        && matches!(db_err.code().as_deref(), Some(SQLITE_BUSY) | Some(SQLITE_LOCKED))
    {
        return true;
    }

    let msg = sqlx_err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn backoff(attempt: u32) -> Duration {
    let capped = BUSY_BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying while SQLite reports the database as busy.
pub async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = backoff(attempt);
                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = BUSY_MAX_RETRIES,
                    delay_ms = delay.as_millis() as u64,
                    "Store busy, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if is_busy(&err) {
                    warn!(op = op_name, "Store still busy after {} retries", attempt);
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..40 {
            assert!(backoff(attempt) <= Duration::from_millis(BUSY_MAX_DELAY_MS));
        }
        assert!(backoff(0) >= Duration::from_millis(BUSY_BASE_DELAY_MS));
    }

    #[test]
    fn test_non_database_errors_are_not_busy() {
        assert!(!is_busy(&Error::Other("database is locked".to_string())));
        assert!(!is_busy(&Error::Persistence(sqlx::Error::RowNotFound)));
    }

    #[tokio::test]
    async fn test_other_errors_are_returned_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_busy("test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Persistence(sqlx::Error::RowNotFound))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let value = retry_on_busy("test", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }
}
