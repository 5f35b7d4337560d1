use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Fixed-interval gate: consecutive calls are at least `interval` apart.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Reserve the next slot and wait for it. Returns false if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };

        tokio::select! {
            _ = sleep_until(slot) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_five_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.acquire(&cancel).await);
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(800), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1_000), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_distinct_slots() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await;
                Instant::now()
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap().duration_since(start));
        }
        times.sort();
        assert!(times[1] - times[0] >= Duration::from_millis(100));
        assert!(times[2] - times[1] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_releases_waiter() {
        let limiter = RateLimiter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();

        assert!(limiter.acquire(&cancel).await);
        cancel.cancel();
        assert!(!limiter.acquire(&cancel).await);
    }
}
