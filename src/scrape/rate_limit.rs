//! Job-scoped token bucket for requests-per-minute limiting.

use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Token bucket refilled from monotonic elapsed time. `acquire` waits
/// cooperatively until enough tokens exist; fairness comes from the short
/// poll interval rather than a strict FIFO queue.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    capacity: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl TokenBucket {
    pub fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute.max(1) as f64;
        TokenBucket {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            rate_per_sec: capacity / 60.0,
            capacity,
        }
    }

    /// Wait until `n` tokens are available, then take them.
    pub async fn acquire(&self, n: u32) {
        let n = n as f64;
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
            if state.tokens >= n {
                state.tokens -= n;
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Tokens currently available (diagnostics only).
    pub async fn available(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.rate_per_sec).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_up_to_capacity_is_immediate() {
        let bucket = TokenBucket::new(60);
        bucket.acquire(60).await;
        assert!(bucket.available().await < 1.0);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(6000); // 100 tokens/sec, quick refill
        bucket.acquire(6000).await;

        let start = Instant::now();
        bucket.acquire(10).await;
        // 10 tokens at 100/sec needs ~100ms of refill.
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
