//! Per-provider token bucket pacing outbound calls.
//!
//! Refill, read and decrement happen in one critical section, so concurrent
//! callers never drive the token count negative. Waiting happens outside the
//! lock with `tokio::time::sleep`.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::RateConfig;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with a fractional token count clamped to `[0, capacity]`.
#[derive(Debug)]
pub struct TokenBucket {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(name: impl Into<String>, config: RateConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            name: name.into(),
            capacity,
            refill_per_sec: config.per_second.max(f64::MIN_POSITIVE),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(provider = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Takes a token if one is available, otherwise returns the wait until
    /// the next token.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let secs = (1.0 - state.tokens) / self.refill_per_sec;
            Err(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        }
    }

    /// Waits for a token.
    ///
    /// If the wait for the next token would pass `deadline`, gives up
    /// immediately and returns that wait.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<(), Duration> {
        loop {
            let wait = match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            if let Some(deadline) = deadline
                && Instant::now()
                    .checked_add(wait)
                    .is_none_or(|ready| ready > deadline)
            {
                tracing::debug!(
                    provider = %self.name,
                    wait_ms = %wait.as_millis(),
                    "Token wait would exceed deadline"
                );
                return Err(wait);
            }

            tracing::debug!(
                provider = %self.name,
                wait_ms = %wait.as_millis(),
                "Throttling request"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Current token level, refilled to now without mutating the bucket.
    pub fn available(&self) -> f64 {
        let state = self.lock_state();
        let elapsed = Instant::now()
            .saturating_duration_since(state.last_refill)
            .as_secs_f64();
        (state.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }
}
