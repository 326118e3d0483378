//! Bandwidth shaping
//!
//! A token-bucket limiter wrapped around transfer reads and writes. The
//! bucket refills ten times a second; a transfer consuming more than the
//! available budget sleeps until enough tokens accumulate. Rate changes
//! apply atomically to in-flight transfers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Refill interval; rate/10 of the per-second budget per tick.
const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket limiting one direction of one transfer.
///
/// A rate of 0 disables shaping. Rates are KB/s to match the user
/// model.
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes per second; 0 means unlimited.
    rate_bytes: AtomicI64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_kbps: i64) -> Self {
        let rate_bytes = rate_kbps.max(0) * 1024;
        Self {
            rate_bytes: AtomicI64::new(rate_bytes),
            state: Mutex::new(BucketState {
                available: rate_bytes as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Replace the rate; takes effect on the next wait.
    pub fn set_rate(&self, rate_kbps: i64) {
        self.rate_bytes
            .store(rate_kbps.max(0) * 1024, Ordering::Relaxed);
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_bytes.load(Ordering::Relaxed) == 0
    }

    /// Account `bytes` against the bucket, sleeping until the budget
    /// allows them. Whole chunks are debited at once; the average rate
    /// converges on the configured value.
    pub async fn consume(&self, bytes: usize) {
        loop {
            let rate = self.rate_bytes.load(Ordering::Relaxed);
            if rate == 0 || bytes == 0 {
                return;
            }
            let rate = rate as f64;
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.last_refill = now;
                // Cap the burst at one second of budget
                state.available = (state.available + elapsed * rate).min(rate);
                if state.available >= bytes as f64 {
                    state.available -= bytes as f64;
                    None
                } else {
                    let deficit = bytes as f64 - state.available;
                    Some(Duration::from_secs_f64(deficit / rate).min(Duration::from_secs(1)))
                }
            };
            match wait {
                None => return,
                Some(duration) => {
                    tokio::time::sleep(duration.max(REFILL_INTERVAL)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_sleeps() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.consume(1024 * 1024).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_is_enforced_on_average() {
        // 100 KB/s, consume 300 KB: needs ~2s beyond the initial burst.
        let limiter = RateLimiter::new(100);
        let start = Instant::now();
        for _ in 0..30 {
            limiter.consume(10 * 1024).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1800), "elapsed {:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(2300), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_change_applies_to_inflight() {
        let limiter = RateLimiter::new(1);
        limiter.set_rate(0);
        let start = Instant::now();
        limiter.consume(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
