use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::reliability::RankConfig;

/// How the candidate order for `discover` is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RankPolicy {
    /// `priority_weight` descending, id ascending.
    #[default]
    Static,
    /// Static order blended with reliability ranks, recomputed every `refresh`.
    Blended {
        /// Share of the reliability score in `[0, 1]`.
        weight: f64,
        refresh: Duration,
    },
}

/// Orchestrator-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    /// Applied to every provider's breaker.
    pub breaker: CircuitBreakerConfig,
    /// Maximum concurrent calls in broad discovery.
    pub broad_concurrency: usize,
    /// Outcomes kept per provider for health snapshots.
    pub recent_outcomes: usize,
    pub rank_policy: RankPolicy,
    pub rank: RankConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            broad_concurrency: 4,
            recent_outcomes: 20,
            rank_policy: RankPolicy::Static,
            rank: RankConfig::default(),
        }
    }
}

const DEFAULT_RANK_REFRESH_SECS: u64 = 300;

impl ManagerConfig {
    /// Read configuration from environment variables.
    ///
    /// - `CONDUIT_FAILURE_THRESHOLD` (optional, defaults to 5)
    /// - `CONDUIT_COOLDOWN_SECS` (optional, defaults to 30)
    /// - `CONDUIT_HALF_OPEN_TRIALS` (optional, defaults to 2)
    /// - `CONDUIT_BROAD_CONCURRENCY` (optional, defaults to 4)
    /// - `CONDUIT_RECENT_OUTCOMES` (optional, defaults to 20)
    /// - `CONDUIT_RANK_BLEND` (optional, `0` keeps the static order)
    /// - `CONDUIT_RANK_REFRESH_SECS` (optional, defaults to 300)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let failure_threshold = positive(&lookup, "CONDUIT_FAILURE_THRESHOLD")?
            .unwrap_or(defaults.breaker.failure_threshold);
        let half_open_max_trials = positive(&lookup, "CONDUIT_HALF_OPEN_TRIALS")?
            .unwrap_or(defaults.breaker.half_open_max_trials);
        let cooldown = match parse::<u64, _>(&lookup, "CONDUIT_COOLDOWN_SECS", "a whole number of seconds")? {
            Some(secs) => Duration::from_secs(secs),
            None => defaults.breaker.cooldown,
        };
        let broad_concurrency = positive(&lookup, "CONDUIT_BROAD_CONCURRENCY")?
            .unwrap_or(defaults.broad_concurrency);
        let recent_outcomes = parse(&lookup, "CONDUIT_RECENT_OUTCOMES", "a non-negative integer")?
            .unwrap_or(defaults.recent_outcomes);

        let blend: f64 = parse(&lookup, "CONDUIT_RANK_BLEND", "a number between 0 and 1")?
            .unwrap_or(0.0);
        if !(0.0..=1.0).contains(&blend) {
            return Err(AppError::ConfigError(format!(
                "Invalid CONDUIT_RANK_BLEND '{blend}': must be between 0 and 1"
            )));
        }
        let refresh_secs = positive::<u64, _>(&lookup, "CONDUIT_RANK_REFRESH_SECS")?
            .unwrap_or(DEFAULT_RANK_REFRESH_SECS);
        let rank_policy = if blend > 0.0 {
            RankPolicy::Blended {
                weight: blend,
                refresh: Duration::from_secs(refresh_secs),
            }
        } else {
            RankPolicy::Static
        };

        let breaker = CircuitBreakerConfig {
            failure_threshold,
            cooldown,
            half_open_max_trials,
            max_cooldown: defaults.breaker.max_cooldown.max(cooldown),
            ..defaults.breaker
        };

        Ok(Self {
            breaker,
            broad_concurrency,
            recent_outcomes,
            rank_policy,
            rank: defaults.rank,
        })
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_broad_concurrency(mut self, limit: usize) -> Self {
        self.broad_concurrency = limit.max(1);
        self
    }

    pub fn with_recent_outcomes(mut self, capacity: usize) -> Self {
        self.recent_outcomes = capacity;
        self
    }

    pub fn with_rank_policy(mut self, policy: RankPolicy) -> Self {
        self.rank_policy = policy;
        self
    }

    pub fn with_rank_config(mut self, rank: RankConfig) -> Self {
        self.rank = rank;
        self
    }
}

fn parse<T, F>(lookup: &F, key: &str, expected: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {key} '{raw}': must be {expected}"))
        }),
    }
}

fn positive<T, F>(lookup: &F, key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr + PartialEq + Default,
    F: Fn(&str) -> Option<String>,
{
    let value: Option<T> = parse(lookup, key, "a positive integer")?;
    if value.as_ref().is_some_and(|v| *v == T::default()) {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(value)
}
