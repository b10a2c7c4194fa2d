//! Time source for the polling loop.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

/// Wall clock and timer used by workers.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current time as Unix epoch milliseconds (UTC).
    fn now_ms(&self) -> i64;

    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Clock backed by `chrono` and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    #[inline]
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_sleeps_on_tokio_timer() {
        let start = tokio::time::Instant::now();
        SystemClock.sleep(Duration::from_millis(1500)).await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[test]
    fn test_system_clock_now() {
        let before = Utc::now().timestamp_millis();
        let now = SystemClock.now_ms();
        assert!(now >= before);
    }
}
