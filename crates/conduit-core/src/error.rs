use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::models::{Operation, ProviderId};

/// Classification of a failed provider call.
///
/// The orchestrator only looks at the class, never at the underlying cause,
/// when deciding breaker and fallback behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientNetwork,
    Timeout,
    RateLimitedByProvider,
    RateLimitedLocally,
    BlockedOrBanned,
    ParseError,
    UnsupportedOperation,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TransientNetwork => "transient_network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimitedByProvider => "rate_limited_by_provider",
            ErrorClass::RateLimitedLocally => "rate_limited_locally",
            ErrorClass::BlockedOrBanned => "blocked_or_banned",
            ErrorClass::ParseError => "parse_error",
            ErrorClass::UnsupportedOperation => "unsupported_operation",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "transient_network" => Ok(ErrorClass::TransientNetwork),
            "timeout" => Ok(ErrorClass::Timeout),
            "rate_limited_by_provider" => Ok(ErrorClass::RateLimitedByProvider),
            "rate_limited_locally" => Ok(ErrorClass::RateLimitedLocally),
            "blocked_or_banned" => Ok(ErrorClass::BlockedOrBanned),
            "parse_error" => Ok(ErrorClass::ParseError),
            "unsupported_operation" => Ok(ErrorClass::UnsupportedOperation),
            _ => Err(format!("Unknown error class: {}", s)),
        }
    }
}

/// Errors a connector may return from any operation.
///
/// An empty result is *not* an error; connectors return `Ok(vec![])` when the
/// provider legitimately has nothing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Connection refused/reset, DNS failure, 5xx and similar blips.
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// The call did not finish before its deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The provider told us to slow down (HTTP 429 or equivalent).
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider blocked the request (ban, challenge page, revoked access).
    #[error("Blocked by provider: {0}")]
    Blocked(String),

    /// The response could not be understood.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The connector does not implement this operation.
    #[error("Operation '{0}' is not supported by this provider")]
    Unsupported(Operation),
}

impl ConnectorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectorError::TransientNetwork(_) => ErrorClass::TransientNetwork,
            ConnectorError::Timeout(_) => ErrorClass::Timeout,
            ConnectorError::RateLimited { .. } => ErrorClass::RateLimitedByProvider,
            ConnectorError::Blocked(_) => ErrorClass::BlockedOrBanned,
            ConnectorError::Parse(_) => ErrorClass::ParseError,
            ConnectorError::Unsupported(_) => ErrorClass::UnsupportedOperation,
        }
    }

    /// Returns true if this error is transient and worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::TransientNetwork(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::RateLimited { .. }
        )
    }

    /// Returns true if this error is a health signal for the circuit breaker.
    ///
    /// `Unsupported` is a configuration mismatch and never counts.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, ConnectorError::Unsupported(_))
    }

    /// How far this failure pushes a breaker with the given threshold toward
    /// opening. A ban opens it outright.
    pub fn breaker_weight(&self, failure_threshold: u32) -> u32 {
        match self {
            ConnectorError::Blocked(_) => failure_threshold.max(1),
            ConnectorError::RateLimited { .. } => 2,
            ConnectorError::TransientNetwork(_)
            | ConnectorError::Timeout(_)
            | ConnectorError::Parse(_) => 1,
            ConnectorError::Unsupported(_) => 0,
        }
    }
}

/// Why a single candidate did not produce a result during resolve/discover.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// The connector was invoked and failed.
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    /// The local token bucket could not admit the call before the deadline.
    #[error("Local rate budget exhausted, next token in {}ms", .wait.as_millis())]
    RateLimitedLocally { wait: Duration },

    /// The breaker rejected the call without invoking the connector.
    #[error("Circuit open, retry after {}s", .retry_after.as_secs())]
    CircuitOpen { retry_after: Duration },

    #[error("Provider is not registered")]
    UnknownProvider,

    #[error("Request cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Error class in the shared taxonomy, if this attempt maps onto one.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            AttemptError::Connector(e) => Some(e.class()),
            AttemptError::RateLimitedLocally { .. } => Some(ErrorClass::RateLimitedLocally),
            AttemptError::CircuitOpen { .. }
            | AttemptError::UnknownProvider
            | AttemptError::Cancelled => None,
        }
    }

    /// Stable machine-readable label, used in summaries and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptError::CircuitOpen { .. } => "circuit_open",
            AttemptError::UnknownProvider => "unknown_provider",
            AttemptError::Cancelled => "cancelled",
            other => other.class().map_or("unknown", |c| c.as_str()),
        }
    }

    /// True if the connector was never called for this attempt.
    pub fn was_skipped(&self) -> bool {
        !matches!(self, AttemptError::Connector(_))
    }
}

impl Serialize for AttemptError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AttemptError", 2)?;
        state.serialize_field("kind", self.label())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// One candidate that failed or was skipped within a logical request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAttempt {
    pub provider_id: ProviderId,
    pub error: AttemptError,
}

/// Aggregate failure returned when no candidate produced a terminal result.
///
/// Operational detail only: the serving layer should present this to end users
/// as "no results available right now".
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub operation: Operation,
    pub attempts: Vec<FailedAttempt>,
}

impl ErrorSummary {
    pub fn new(operation: Operation, attempts: Vec<FailedAttempt>) -> Self {
        Self {
            operation,
            attempts,
        }
    }

    pub fn single(operation: Operation, provider_id: ProviderId, error: AttemptError) -> Self {
        Self::new(
            operation,
            vec![FailedAttempt { provider_id, error }],
        )
    }

    /// `(provider, label)` pairs in the order the candidates were tried.
    pub fn classes(&self) -> Vec<(&ProviderId, &'static str)> {
        self.attempts
            .iter()
            .map(|a| (&a.provider_id, a.error.label()))
            .collect()
    }

    pub fn was_cancelled(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| matches!(a.error, AttemptError::Cancelled))
    }

    /// The first attempt's error, which for `resolve` is the only one.
    pub fn primary(&self) -> Option<&AttemptError> {
        self.attempts.first().map(|a| &a.error)
    }
}

impl fmt::Display for ErrorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attempts.is_empty() {
            return write!(f, "No provider supports '{}'", self.operation);
        }
        write!(f, "'{}' failed on all candidates:", self.operation)?;
        for attempt in &self.attempts {
            write!(f, " {}={}", attempt.provider_id, attempt.error.label())?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorSummary {}

/// Setup and configuration errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Two connectors declared the same provider id.
    #[error("Provider '{0}' is registered more than once")]
    DuplicateProvider(ProviderId),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
