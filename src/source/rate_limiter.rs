//! Strictly periodic request floor.
//!
//! No burst allowance: two calls never start closer together than
//! `min_interval`. The gate holds its lock while sleeping, so concurrent
//! callers queue up behind each other instead of racing on the timestamp.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until the next call is allowed, then claim the slot.
    pub async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                trace!("Rate limiter: waiting {:?}", wait);
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.throttle().await;
        f().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_is_immediate() {
        let limiter = RateLimiter::new(Duration::from_millis(1100));
        let start = Instant::now();
        let v = limiter.execute(|| async { 7 }).await;
        assert_eq!(v, 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(1100));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.throttle().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(2200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_idle_gap() {
        let limiter = RateLimiter::new(Duration::from_millis(500));
        limiter.throttle().await;
        sleep(Duration::from_secs(2)).await;

        let before = Instant::now();
        limiter.throttle().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(1000)));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.execute(|| async { Instant::now() }).await
            }));
        }

        let mut fired = Vec::new();
        for h in handles {
            fired.push(h.await.unwrap());
        }
        fired.sort();
        for pair in fired.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000));
        }
    }
}
