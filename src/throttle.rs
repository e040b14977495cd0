// ===============================
// src/throttle.rs
// ===============================
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// State throttle sederhana: jaga jarak minimum antar request ke info API.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Mutex::new(None) }
    }

    /// Waits until `min_interval` has passed since the previous `acquire` returned.
    /// Concurrent callers queue on the inner lock, so spacing holds for all of them.
    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            if Instant::now() < ready_at {
                debug!(wait_ms = (ready_at - Instant::now()).as_millis() as u64, "rate limit wait");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let rl = RateLimiter::new(Duration::from_millis(200));
        let t0 = Instant::now();
        rl.acquire().await;
        assert_eq!(Instant::now(), t0);
    }

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_acquires() {
        let rl = RateLimiter::new(Duration::from_millis(200));
        let t0 = Instant::now();
        rl.acquire().await;
        rl.acquire().await;
        rl.acquire().await;
        assert!(Instant::now() - t0 >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn no_wait_after_interval_elapsed() {
        let rl = RateLimiter::new(Duration::from_millis(200));
        rl.acquire().await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        let t1 = Instant::now();
        rl.acquire().await;
        assert_eq!(Instant::now(), t1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_are_spaced() {
        let rl = Arc::new(RateLimiter::new(Duration::from_millis(100)));
        let t0 = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let rl = rl.clone();
            handles.push(tokio::spawn(async move { rl.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(Instant::now() - t0 >= Duration::from_millis(300));
    }
}
