//! Per-provider outcome history and health snapshots.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorClass;
use crate::models::{Operation, ProviderId};

/// Why a candidate was passed over without calling the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    CircuitOpen,
    RateLimitedLocally,
}

/// What happened to one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    Success { items: usize },
    Empty,
    /// A health probe passed.
    Healthy,
    Failed { class: ErrorClass },
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub at: DateTime<Utc>,
    pub operation: Operation,
    #[serde(flatten)]
    pub kind: OutcomeKind,
    pub latency_ms: u64,
}

impl OutcomeRecord {
    pub fn new(operation: Operation, kind: OutcomeKind, latency: Duration) -> Self {
        Self {
            at: Utc::now(),
            operation,
            kind,
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Bounded ring of the most recent outcomes, oldest first.
#[derive(Debug)]
pub struct OutcomeLog {
    capacity: usize,
    entries: Mutex<VecDeque<OutcomeRecord>>,
}

impl OutcomeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, VecDeque<OutcomeRecord>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned outcome log mutex");
            poisoned.into_inner()
        })
    }

    pub fn push(&self, record: OutcomeRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock_entries();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<OutcomeRecord> {
        self.lock_entries().iter().cloned().collect()
    }
}

/// Read-only view of one provider for dashboards and the `health` command.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub provider_id: ProviderId,
    pub display_name: String,
    pub breaker_state: CircuitState,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub token_level: f64,
    pub token_capacity: f64,
    pub recent_outcomes: Vec<OutcomeRecord>,
}
