//! A shared token bucket gating how fast workers dispatch LLM requests (C1).
//!
//! The bucket refills continuously (capacity / 60s) rather than in discrete
//! per-minute windows. All operations are infallible; there is no error
//! path here, only waiting.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::prelude::*;

const WINDOW_SECONDS: f64 = 60.0;

#[derive(Debug, Clone)]
struct BucketState {
    tokens: f64,
    capacity: f64,
    last_update: Instant,
    total_consumed: u64,
    total_waited: Duration,
    last_429: Option<Instant>,
}

impl BucketState {
    fn new(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            last_update: Instant::now(),
            total_consumed: 0,
            total_waited: Duration::ZERO,
            last_429: None,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        let tokens_to_add = (elapsed / WINDOW_SECONDS) * self.capacity;
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity);
        self.last_update = now;
    }

    fn wait_time_for(&self, tokens_needed: f64) -> Duration {
        let tokens_short = tokens_needed - self.tokens;
        if tokens_short <= 0.0 {
            return Duration::ZERO;
        }
        let seconds_per_token = WINDOW_SECONDS / self.capacity;
        Duration::from_secs_f64(tokens_short * seconds_per_token)
    }
}

/// A read-only snapshot of the rate limiter's state, for diagnostics and
/// [`crate::model::BatchStats`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterStatus {
    /// Tokens currently available (may be fractional internally; rounded
    /// down here).
    pub tokens_available: i64,
    /// Bucket capacity (requests per minute).
    pub limit: u32,
    /// Fraction of capacity currently consumed, in `[0, 1]` (can exceed 1
    /// briefly under the race described in [`RateLimiter::consume`]).
    pub utilization: f64,
    /// Seconds until a token will be available.
    pub time_until_token_secs: f64,
    /// Total tokens consumed over the limiter's lifetime.
    pub total_consumed: u64,
    /// Total time spent waiting for tokens, across all callers.
    pub total_waited: Duration,
    /// When `record_429` was last called, if ever.
    pub last_429: Option<Instant>,
}

/// A shared, continuously-refilling token bucket.
///
/// Cheap to clone: internally an `Arc`-free `Mutex` wrapped by the caller
/// (typically held behind an `Arc<RateLimiter>` shared across worker
/// tasks).
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Build a limiter with the given requests-per-minute capacity.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            state: Mutex::new(BucketState::new(requests_per_minute)),
        }
    }

    /// Is at least one token available right now?
    pub async fn can_execute(&self) -> bool {
        let mut state = self.state.lock().await;
        state.refill();
        state.tokens >= 1.0
    }

    /// Consume `count` tokens, waiting if necessary.
    ///
    /// This is a three-step lock/sleep/lock dance: compute the wait with
    /// the lock held, sleep with it released, then re-check and consume
    /// regardless of the outcome. If another caller drained the bucket
    /// while we slept, we consume anyway and let `tokens` go negative —
    /// the bucket self-corrects on the next refill, and that's cheaper
    /// than risking a second, unbounded wait.
    pub async fn consume(&self, count: u32) -> Duration {
        let count = count as f64;

        let wait = {
            let mut state = self.state.lock().await;
            state.refill();
            state.wait_time_for(count)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mut state = self.state.lock().await;
        if !wait.is_zero() {
            state.total_waited += wait;
        }
        state.refill();
        state.tokens -= count;
        state.total_consumed += count as u64;

        wait
    }

    /// Try to consume `count` tokens without waiting; `false` if the bucket
    /// doesn't have enough right now.
    pub async fn try_consume(&self, count: u32) -> bool {
        let mut state = self.state.lock().await;
        state.refill();
        let count = count as f64;
        if state.tokens >= count {
            state.tokens -= count;
            state.total_consumed += count as u64;
            true
        } else {
            false
        }
    }

    /// Seconds until at least one token will be available (0.0 if one
    /// already is).
    pub async fn time_until_token(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.refill();
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            state.wait_time_for(1.0)
        }
    }

    /// Record a 429 response. When the provider supplied a `Retry-After`,
    /// the bucket is forced empty so the next `consume` backs off;
    /// callers still sleep `retry_after` themselves in the retry path.
    pub async fn record_429(&self, retry_after: Option<Duration>) {
        let mut state = self.state.lock().await;
        state.last_429 = Some(Instant::now());
        if retry_after.is_some() {
            state.tokens = 0.0;
        }
    }

    /// Change the bucket's capacity, scaling the current token count
    /// proportionally so a mid-flight adjustment doesn't instantly empty
    /// or overfill the bucket.
    pub async fn adjust_limit(&self, new_limit: u32) {
        let mut state = self.state.lock().await;
        let scale = new_limit as f64 / state.capacity;
        state.tokens = (state.tokens * scale).min(new_limit as f64);
        state.capacity = new_limit as f64;
    }

    /// A snapshot of current limiter state for diagnostics.
    pub async fn status(&self) -> RateLimiterStatus {
        let mut state = self.state.lock().await;
        state.refill();
        let time_until_token = if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            state.wait_time_for(1.0)
        };
        RateLimiterStatus {
            tokens_available: state.tokens as i64,
            limit: state.capacity as u32,
            utilization: (state.capacity - state.tokens) / state.capacity,
            time_until_token_secs: time_until_token.as_secs_f64(),
            total_consumed: state.total_consumed,
            total_waited: state.total_waited,
            last_429: state.last_429,
        }
    }

    /// Reset the bucket to a full, fresh state. Used by tests.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let capacity = state.capacity;
        *state = BucketState::new(capacity as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_full() {
        let limiter = RateLimiter::new(60);
        assert!(limiter.can_execute().await);
        let status = limiter.status().await;
        assert_eq!(status.tokens_available, 60);
        assert_eq!(status.utilization, 0.0);
    }

    #[tokio::test]
    async fn consume_drains_bucket() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            assert!(limiter.try_consume(1).await);
        }
        assert!(!limiter.try_consume(1).await);
    }

    #[tokio::test]
    async fn consume_waits_when_empty() {
        let limiter = RateLimiter::new(600); // 10/sec, so one token ~= 100ms
        for _ in 0..600 {
            assert!(limiter.try_consume(1).await);
        }
        let start = Instant::now();
        let waited = limiter.consume(1).await;
        assert!(waited > Duration::ZERO);
        assert!(start.elapsed() >= waited.mul_f64(0.8));
    }

    #[tokio::test]
    async fn record_429_with_retry_after_zeroes_bucket() {
        let limiter = RateLimiter::new(60);
        limiter.record_429(Some(Duration::from_secs(2))).await;
        let status = limiter.status().await;
        assert_eq!(status.tokens_available, 0);
        assert!(status.last_429.is_some());
    }

    #[tokio::test]
    async fn record_429_without_retry_after_leaves_tokens() {
        let limiter = RateLimiter::new(60);
        limiter.record_429(None).await;
        let status = limiter.status().await;
        assert_eq!(status.tokens_available, 60);
        assert!(status.last_429.is_some());
    }

    #[tokio::test]
    async fn adjust_limit_scales_tokens() {
        let limiter = RateLimiter::new(60);
        for _ in 0..30 {
            limiter.try_consume(1).await;
        }
        limiter.adjust_limit(120).await;
        let status = limiter.status().await;
        assert_eq!(status.limit, 120);
        assert_eq!(status.tokens_available, 60);
    }
}
