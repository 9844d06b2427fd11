//! Per-provider circuit breaker.
//!
//! Stops the orchestrator from hammering a provider that keeps failing, and
//! lets a bounded number of trial calls through once the cooldown has passed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[weighted failures >= threshold]--> OPEN --[cooldown elapsed, next admission]--> HALF_OPEN
//!                                               ^                                              |
//!                                               +-----------------[any trial fails]------------+
//!                                                                                              |
//! CLOSED <------------------------------[all trials succeed]-----------------------------------+
//! ```
//!
//! Admission hands out a [`BreakerPermit`]; the caller settles it with the
//! call's outcome. A permit dropped without an outcome gives its trial slot
//! back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::error::{AttemptError, ConnectorError};

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without reaching the provider.
    Open,
    /// A limited number of trial calls probe for recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Weighted failure count that opens the circuit.
    pub failure_threshold: u32,

    /// Time to wait before an open circuit admits trial calls.
    pub cooldown: Duration,

    /// Trial calls admitted while half-open; all must succeed to close.
    pub half_open_max_trials: u32,

    /// When the circuit opens because the provider rate-limited us, multiply
    /// the cooldown by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound for the cooldown after rate limit backoffs.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_trials: 2,
            rate_limit_backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Trial slots handed out in the current half-open window.
    trials_admitted: u32,
    trial_successes: u32,
    opened_at: Option<Instant>,
    current_cooldown: Duration,
    last_error: Option<String>,
    /// Bumped on every state transition.
    generation: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trials_admitted: 0,
            trial_successes: 0,
            opened_at: None,
            current_cooldown: config.cooldown,
            last_error: None,
            generation: 0,
        }
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|t| self.current_cooldown.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or(self.current_cooldown)
    }
}

/// Point-in-time view of a breaker for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trials_admitted: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Thread-safe circuit breaker guarding one provider.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(provider = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Stored state. Does not perform the lazy Open → HalfOpen transition;
    /// only an admission check does that.
    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();
        let time_until_half_open = (inner.state == CircuitState::Open)
            .then(|| inner.remaining_cooldown(Instant::now()));

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trials_admitted: inner.trials_admitted,
            last_error: inner.last_error.clone(),
            time_until_half_open,
        }
    }

    /// Asks to place one call.
    ///
    /// - Closed: always admitted
    /// - Open: rejected with [`AttemptError::CircuitOpen`] until the cooldown
    ///   has elapsed; the first check after that moves to HalfOpen
    /// - HalfOpen: admitted while trial slots remain
    pub fn try_acquire(&self) -> Result<BreakerPermit, AttemptError> {
        let mut inner = self.lock_inner();
        let now = Instant::now();
        self.maybe_transition_to_half_open(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(self.permit(inner.generation, false)),
            CircuitState::Open => Err(AttemptError::CircuitOpen {
                retry_after: inner.remaining_cooldown(now),
            }),
            CircuitState::HalfOpen => {
                if inner.trials_admitted >= self.config.half_open_max_trials {
                    tracing::debug!(
                        provider = %self.name,
                        trials = inner.trials_admitted,
                        "Half-open trial slots exhausted"
                    );
                    return Err(AttemptError::CircuitOpen {
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trials_admitted += 1;
                Ok(self.permit(inner.generation, true))
            }
        }
    }

    fn permit(&self, generation: u64, trial: bool) -> BreakerPermit {
        BreakerPermit {
            breaker: self.clone(),
            generation,
            trial,
            settled: false,
        }
    }

    fn record_success(&self, generation: u64) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen if inner.generation == generation => {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_max_trials {
                    tracing::info!(
                        provider = %self.name,
                        trials = inner.trial_successes,
                        "Circuit breaker closing after successful trials"
                    );
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.trials_admitted = 0;
                    inner.trial_successes = 0;
                    inner.opened_at = None;
                    inner.last_error = None;
                    inner.current_cooldown = self.config.cooldown;
                    inner.generation += 1;
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn record_failure(&self, generation: u64, error: &ConnectorError) {
        let weight = error.breaker_weight(self.config.failure_threshold);
        let is_rate_limit = matches!(error, ConnectorError::RateLimited { .. });
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(weight);
                inner.last_error = Some(error.to_string());

                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        provider = %self.name,
                        failures = inner.consecutive_failures,
                        error = %error,
                        "Circuit breaker opening"
                    );
                    self.trip(&mut inner, is_rate_limit);
                }
            }
            CircuitState::HalfOpen if inner.generation == generation => {
                tracing::warn!(
                    provider = %self.name,
                    error = %error,
                    "Circuit breaker trial failed, returning to open state"
                );
                inner.last_error = Some(error.to_string());
                self.trip(&mut inner, is_rate_limit);
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.last_error = Some(error.to_string());
            }
        }
    }

    fn release_trial(&self, generation: u64) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.trials_admitted = inner.trials_admitted.saturating_sub(1);
        }
    }

    fn trip(&self, inner: &mut CircuitBreakerInner, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trials_admitted = 0;
        inner.trial_successes = 0;
        inner.generation += 1;

        if is_rate_limit {
            inner.current_cooldown = std::cmp::min(
                Duration::from_secs_f32(
                    inner.current_cooldown.as_secs_f32() * self.config.rate_limit_backoff_multiplier,
                ),
                self.config.max_cooldown,
            );
            tracing::info!(
                provider = %self.name,
                cooldown_secs = inner.current_cooldown.as_secs(),
                "Extended cooldown due to provider rate limit"
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(provider = %self.name, "Circuit breaker manually reset");
        let generation = inner.generation + 1;
        *inner = CircuitBreakerInner::new(&self.config);
        inner.generation = generation;
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner, now: Instant) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && now.saturating_duration_since(opened_at) >= inner.current_cooldown
        {
            tracing::info!(
                provider = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.trials_admitted = 0;
            inner.trial_successes = 0;
            inner.generation += 1;
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping it unsettled returns a half-open trial slot.
#[derive(Debug)]
#[must_use = "a permit must be settled with the call outcome"]
pub struct BreakerPermit {
    breaker: CircuitBreaker,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    /// True if this permit consumed a half-open trial slot.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// The call returned a result (including an empty one).
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.generation);
    }

    /// The call failed. Failures with no breaker weight leave the breaker
    /// untouched, as if the call never happened.
    pub fn failure(mut self, error: &ConnectorError) {
        if !error.counts_against_breaker() {
            return;
        }
        self.settled = true;
        self.breaker.record_failure(self.generation, error);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.release_trial(self.generation);
        }
    }
}
