pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod models;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reliability;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
pub mod traits;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{ManagerConfig, RankPolicy};
pub use error::{AppError, AttemptError, ConnectorError, ErrorClass, ErrorSummary, FailedAttempt};
pub use health::ProviderHealth;
pub use models::{
    Capabilities, ListEntry, Operation, Payload, ProviderDescriptor, ProviderId, RateConfig,
    Request, SearchItem, SubEntry,
};
pub use orchestrator::{CallOptions, DiscoveryMode, Resolved, SourceManager, SourceManagerBuilder};
pub use reliability::{RankSnapshot, ReliabilityGraph};
pub use traits::Connector;
