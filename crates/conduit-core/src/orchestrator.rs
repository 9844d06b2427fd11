//! Source Manager: provider registry, fallback and fan-out.
//!
//! Every attempt on a provider goes through the same gate:
//!
//! ```text
//! breaker admission -> token bucket (bounded by deadline) -> connector call (timeout_at)
//!        |                      |                                  |
//!   circuit_open       rate_limited_locally              outcome -> breaker
//! ```
//!
//! `discover` walks candidates in priority order (first success) or fans out
//! to all of them (broad). Fallback transitions and successes feed the
//! reliability graph, which can in turn re-weight the priority order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{ManagerConfig, RankPolicy};
use crate::error::{AppError, AttemptError, ConnectorError, ErrorSummary, FailedAttempt};
use crate::health::{OutcomeKind, OutcomeLog, OutcomeRecord, ProviderHealth, SkipReason};
use crate::models::{Operation, Payload, ProviderDescriptor, ProviderId, Request};
use crate::rate_limiter::TokenBucket;
use crate::reliability::{RankSnapshot, ReliabilityGraph};
use crate::traits::{Connector, invoke};

/// Per-request controls: an absolute deadline and an optional cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// How `discover` uses the candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Try candidates one at a time; stop at the first answer.
    #[default]
    FirstSuccess,
    /// Ask every candidate concurrently and merge the answers.
    Broad,
}

/// A successful logical request.
#[derive(Debug, Clone, Serialize)]
pub struct Resolved {
    pub payload: Payload,
    /// Providers whose answer is in `payload`, in priority order.
    pub served_by: Vec<ProviderId>,
    /// Candidates that failed or were skipped on the way.
    pub failures: Vec<FailedAttempt>,
    pub elapsed: Duration,
}

/// Everything the manager keeps for one registered provider.
struct ProviderSlot {
    connector: Arc<dyn Connector>,
    breaker: CircuitBreaker,
    limiter: TokenBucket,
    outcomes: OutcomeLog,
}

impl ProviderSlot {
    fn descriptor(&self) -> &ProviderDescriptor {
        self.connector.descriptor()
    }

    fn id(&self) -> &ProviderId {
        &self.descriptor().id
    }

    fn supports(&self, operation: Operation) -> bool {
        self.descriptor().capabilities.supports(operation)
    }

    fn record(&self, operation: Operation, kind: OutcomeKind, latency: Duration) {
        self.outcomes.push(OutcomeRecord::new(operation, kind, latency));
    }

    /// Runs one provider call behind the breaker and the token bucket.
    ///
    /// `classify` maps a successful answer to its outcome record.
    async fn guarded<T, Fut>(
        &self,
        operation: Operation,
        options: &CallOptions,
        call: impl FnOnce() -> Fut,
        classify: impl FnOnce(&T) -> OutcomeKind,
    ) -> Result<T, AttemptError>
    where
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        if options.is_cancelled() {
            return Err(AttemptError::Cancelled);
        }

        let permit = match self.breaker.try_acquire() {
            Ok(permit) => permit,
            Err(e) => {
                tracing::debug!(provider = %self.id(), error = %e, "Skipping provider");
                self.record(
                    operation,
                    OutcomeKind::Skipped {
                        reason: SkipReason::CircuitOpen,
                    },
                    Duration::ZERO,
                );
                return Err(e);
            }
        };

        let admitted = until_cancelled(options, self.limiter.acquire(options.deadline))
            .await
            .ok_or(AttemptError::Cancelled)?;
        if let Err(wait) = admitted {
            tracing::debug!(
                provider = %self.id(),
                wait_ms = %wait.as_millis(),
                "Skipping provider, no token before deadline"
            );
            self.record(
                operation,
                OutcomeKind::Skipped {
                    reason: SkipReason::RateLimitedLocally,
                },
                Duration::ZERO,
            );
            return Err(AttemptError::RateLimitedLocally { wait });
        }

        let started = Instant::now();
        let call = call();
        let bounded = async {
            match options.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call)
                    .await
                    .unwrap_or_else(|_| Err(ConnectorError::Timeout(started.elapsed()))),
                None => call.await,
            }
        };
        let result = until_cancelled(options, bounded)
            .await
            .ok_or(AttemptError::Cancelled)?;
        let latency = started.elapsed();

        match result {
            Ok(answer) => {
                permit.success();
                self.record(operation, classify(&answer), latency);
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!(
                    provider = %self.id(),
                    class = %e.class(),
                    error = %e,
                    "Provider call failed"
                );
                permit.failure(&e);
                self.record(operation, OutcomeKind::Failed { class: e.class() }, latency);
                Err(e.into())
            }
        }
    }

    async fn attempt(&self, request: &Request, options: &CallOptions) -> Result<Payload, AttemptError> {
        let connector = self.connector.as_ref();
        self.guarded(
            request.operation(),
            options,
            || invoke(connector, request),
            |payload: &Payload| {
                if payload.is_empty() {
                    OutcomeKind::Empty
                } else {
                    OutcomeKind::Success {
                        items: payload.len(),
                    }
                }
            },
        )
        .await
    }

    async fn probe(&self, options: &CallOptions) -> Result<(), AttemptError> {
        let connector = self.connector.as_ref();
        self.guarded(
            Operation::HealthCheck,
            options,
            || connector.health_check(),
            |_: &()| OutcomeKind::Healthy,
        )
        .await
    }

    fn health(&self) -> ProviderHealth {
        let stats = self.breaker.stats();
        ProviderHealth {
            provider_id: self.id().clone(),
            display_name: self.descriptor().display_name.clone(),
            breaker_state: stats.state,
            consecutive_failures: stats.consecutive_failures,
            last_error: stats.last_error,
            retry_after_ms: stats
                .time_until_half_open
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            token_level: self.limiter.available(),
            token_capacity: self.limiter.capacity(),
            recent_outcomes: self.outcomes.snapshot(),
        }
    }
}

/// Races `fut` against the request's cancellation token, if any.
async fn until_cancelled<F: Future>(options: &CallOptions, fut: F) -> Option<F::Output> {
    match &options.cancel {
        Some(token) => tokio::select! {
            out = fut => Some(out),
            () = token.cancelled() => None,
        },
        None => Some(fut.await),
    }
}

/// Registers connectors and builds a [`SourceManager`].
pub struct SourceManagerBuilder {
    config: ManagerConfig,
    connectors: Vec<Arc<dyn Connector>>,
}

impl SourceManagerBuilder {
    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(self, connector: impl Connector + 'static) -> Self {
        self.register_arc(Arc::new(connector))
    }

    pub fn register_arc(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push(connector);
        self
    }

    /// Fails with [`AppError::DuplicateProvider`] if two connectors share an id.
    pub fn build(self) -> Result<SourceManager, AppError> {
        let mut index = HashMap::with_capacity(self.connectors.len());
        let mut slots = Vec::with_capacity(self.connectors.len());
        let graph = ReliabilityGraph::with_config(self.config.rank);

        for connector in self.connectors {
            let descriptor = connector.descriptor();
            if index.contains_key(&descriptor.id) {
                return Err(AppError::DuplicateProvider(descriptor.id.clone()));
            }
            descriptor.rate.validate().map_err(|reason| {
                AppError::ConfigError(format!("Invalid rate for '{}': {reason}", descriptor.id))
            })?;
            index.insert(descriptor.id.clone(), slots.len());
            graph.register(&descriptor.id);

            let name = descriptor.id.to_string();
            slots.push(Arc::new(ProviderSlot {
                breaker: CircuitBreaker::new(name.clone(), self.config.breaker.clone()),
                limiter: TokenBucket::new(name, descriptor.rate),
                outcomes: OutcomeLog::new(self.config.recent_outcomes),
                connector,
            }));
        }

        let static_order = static_order(&slots);
        tracing::info!(
            providers = slots.len(),
            order = ?static_order.iter().map(|&i| slots[i].id().to_string()).collect::<Vec<_>>(),
            "Source manager ready"
        );

        Ok(SourceManager {
            config: self.config,
            slots,
            index,
            graph,
            order: RwLock::new(static_order.clone()),
            static_order,
        })
    }
}

/// `priority_weight` descending, id ascending.
fn static_order(slots: &[Arc<ProviderSlot>]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..slots.len()).collect();
    order.sort_by(|&a, &b| {
        let (da, db) = (slots[a].descriptor(), slots[b].descriptor());
        db.priority_weight
            .cmp(&da.priority_weight)
            .then_with(|| da.id.cmp(&db.id))
    });
    order
}

/// Blends position in the static order with normalized reliability score.
fn blended_order(
    slots: &[Arc<ProviderSlot>],
    static_order: &[usize],
    ranks: &RankSnapshot,
    weight: f64,
) -> Vec<usize> {
    let n = static_order.len();
    let top = ranks.scores.values().copied().fold(0.0_f64, f64::max);
    let mut scored: Vec<(usize, usize, f64)> = static_order
        .iter()
        .enumerate()
        .map(|(pos, &idx)| {
            let static_score = if n > 1 {
                (n - 1 - pos) as f64 / (n - 1) as f64
            } else {
                1.0
            };
            let rank_score = if top > 0.0 {
                ranks.score(slots[idx].id()) / top
            } else {
                0.0
            };
            (pos, idx, (1.0 - weight) * static_score + weight * rank_score)
        })
        .collect();
    scored.sort_by(|a, b| b.2.total_cmp(&a.2).then(a.0.cmp(&b.0)));
    scored.into_iter().map(|(_, idx, _)| idx).collect()
}

/// Orchestrates logical requests across the registered providers.
///
/// Holds no global lock: each provider's breaker, limiter and outcome log
/// lock independently, the graph has its own lock, and the candidate order is
/// only written by [`refresh_ordering`](Self::refresh_ordering).
pub struct SourceManager {
    config: ManagerConfig,
    slots: Vec<Arc<ProviderSlot>>,
    index: HashMap<ProviderId, usize>,
    graph: ReliabilityGraph,
    order: RwLock<Vec<usize>>,
    static_order: Vec<usize>,
}

impl SourceManager {
    pub fn builder() -> SourceManagerBuilder {
        SourceManagerBuilder {
            config: ManagerConfig::default(),
            connectors: Vec::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn graph(&self) -> &ReliabilityGraph {
        &self.graph
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.slots.iter().map(|slot| slot.descriptor())
    }

    /// Current candidate order, all providers.
    pub fn priority_order(&self) -> Vec<ProviderId> {
        self.read_order()
            .iter()
            .map(|&i| self.slots[i].id().clone())
            .collect()
    }

    fn read_order(&self) -> Vec<usize> {
        match self.order.read() {
            Ok(order) => order.clone(),
            Err(poisoned) => {
                tracing::warn!("Recovered from poisoned priority order lock");
                poisoned.into_inner().clone()
            }
        }
    }

    fn candidates(&self, operation: Operation) -> Vec<Arc<ProviderSlot>> {
        self.read_order()
            .into_iter()
            .map(|i| &self.slots[i])
            .filter(|slot| slot.supports(operation))
            .cloned()
            .collect()
    }

    fn slot(&self, id: &ProviderId) -> Option<&Arc<ProviderSlot>> {
        self.index.get(id).map(|&i| &self.slots[i])
    }

    /// Sends `request` to one pinned provider. No fallback; the provider's
    /// classified error surfaces as a single-entry summary.
    pub async fn resolve(
        &self,
        provider_id: &ProviderId,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Resolved, ErrorSummary> {
        let operation = request.operation();
        let span = tracing::info_span!(
            "resolve",
            request_id = %Uuid::new_v4(),
            provider = %provider_id,
            op = %operation,
        );

        async {
            let started = Instant::now();
            let Some(slot) = self.slot(provider_id) else {
                return Err(ErrorSummary::single(
                    operation,
                    provider_id.clone(),
                    AttemptError::UnknownProvider,
                ));
            };

            if !slot.supports(operation) {
                return Err(ErrorSummary::single(
                    operation,
                    provider_id.clone(),
                    ConnectorError::Unsupported(operation).into(),
                ));
            }

            match slot.attempt(request, options).await {
                Ok(payload) => {
                    if !payload.is_empty() {
                        self.graph.record_success(provider_id);
                    }
                    tracing::info!(items = payload.len(), "Resolved");
                    Ok(Resolved {
                        payload,
                        served_by: vec![provider_id.clone()],
                        failures: Vec::new(),
                        elapsed: started.elapsed(),
                    })
                }
                Err(error) => Err(ErrorSummary::single(operation, provider_id.clone(), error)),
            }
        }
        .instrument(span)
        .await
    }

    /// Answers `request` from whichever providers can, per `mode`.
    pub async fn discover(
        &self,
        request: &Request,
        options: &CallOptions,
        mode: DiscoveryMode,
    ) -> Result<Resolved, ErrorSummary> {
        let span = tracing::info_span!(
            "discover",
            request_id = %Uuid::new_v4(),
            op = %request.operation(),
            ?mode,
        );

        async {
            let candidates = self.candidates(request.operation());
            if candidates.is_empty() {
                tracing::warn!("No provider supports this operation");
                return Err(ErrorSummary::new(request.operation(), Vec::new()));
            }
            match mode {
                DiscoveryMode::FirstSuccess => self.first_success(candidates, request, options).await,
                DiscoveryMode::Broad => self.broad(candidates, request, options).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn first_success(
        &self,
        candidates: Vec<Arc<ProviderSlot>>,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Resolved, ErrorSummary> {
        let started = Instant::now();
        let operation = request.operation();
        let mut failures = Vec::new();
        let mut last_failed: Option<ProviderId> = None;

        for slot in candidates {
            let id = slot.id().clone();
            let result = slot.attempt(request, options).await;

            let invoked = match &result {
                Ok(_) => true,
                Err(e) => !e.was_skipped(),
            };
            if invoked && let Some(from) = last_failed.take() {
                self.graph.record_fallback(&from, &id);
            }

            match result {
                Ok(payload) => {
                    if !payload.is_empty() {
                        self.graph.record_success(&id);
                    }
                    tracing::info!(
                        provider = %id,
                        items = payload.len(),
                        fallbacks = failures.len(),
                        "Discovered"
                    );
                    return Ok(Resolved {
                        payload,
                        served_by: vec![id],
                        failures,
                        elapsed: started.elapsed(),
                    });
                }
                Err(AttemptError::Cancelled) => {
                    tracing::info!(provider = %id, "Request cancelled");
                    failures.push(FailedAttempt {
                        provider_id: id,
                        error: AttemptError::Cancelled,
                    });
                    return Err(ErrorSummary::new(operation, failures));
                }
                Err(error) => {
                    if !error.was_skipped() {
                        last_failed = Some(id.clone());
                    }
                    failures.push(FailedAttempt {
                        provider_id: id,
                        error,
                    });
                }
            }
        }

        let summary = ErrorSummary::new(operation, failures);
        tracing::warn!(summary = %summary, "All candidates failed");
        Err(summary)
    }

    async fn broad(
        &self,
        candidates: Vec<Arc<ProviderSlot>>,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Resolved, ErrorSummary> {
        let started = Instant::now();
        let operation = request.operation();
        let limit = Arc::new(Semaphore::new(self.config.broad_concurrency.max(1)));
        // Launched calls drain on their own; the caller's token only stops
        // queued ones from starting.
        let task_options = CallOptions {
            deadline: options.deadline,
            cancel: None,
        };

        let handles: Vec<JoinHandle<Result<Payload, AttemptError>>> = candidates
            .iter()
            .map(|slot| {
                let slot = Arc::clone(slot);
                let request = request.clone();
                let task_options = task_options.clone();
                let cancel = options.cancel.clone();
                let limit = Arc::clone(&limit);
                tokio::spawn(
                    async move {
                        let Ok(_permit) = limit.acquire_owned().await else {
                            return Err(AttemptError::Cancelled);
                        };
                        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                            return Err(AttemptError::Cancelled);
                        }
                        slot.attempt(&request, &task_options).await
                    }
                    .in_current_span(),
                )
            })
            .collect();

        let results = match until_cancelled(options, join_all(handles)).await {
            Some(results) => results,
            None => {
                tracing::info!("Request cancelled, discarding in-flight results");
                let failures = candidates
                    .iter()
                    .map(|slot| FailedAttempt {
                        provider_id: slot.id().clone(),
                        error: AttemptError::Cancelled,
                    })
                    .collect();
                return Err(ErrorSummary::new(operation, failures));
            }
        };

        let mut payload = Payload::empty_for(operation);
        let mut served_by = Vec::new();
        let mut answered_empty = Vec::new();
        let mut failures = Vec::new();

        for (slot, joined) in candidates.iter().zip(results) {
            let id = slot.id().clone();
            let result = joined.unwrap_or_else(|e| {
                tracing::error!(provider = %id, error = %e, "Connector task failed");
                Err(ConnectorError::TransientNetwork(format!("connector task failed: {e}")).into())
            });

            match result {
                Ok(answer) if answer.is_empty() => answered_empty.push(id),
                Ok(answer) => {
                    self.graph.record_success(&id);
                    payload.append(answer);
                    served_by.push(id);
                }
                Err(error) => failures.push(FailedAttempt {
                    provider_id: id,
                    error,
                }),
            }
        }

        if served_by.is_empty() && answered_empty.is_empty() {
            let summary = ErrorSummary::new(operation, failures);
            tracing::warn!(summary = %summary, "All candidates failed");
            return Err(summary);
        }
        if served_by.is_empty() {
            served_by = answered_empty;
        }

        tracing::info!(
            items = payload.len(),
            providers = served_by.len(),
            failed = failures.len(),
            "Broad discovery merged"
        );
        Ok(Resolved {
            payload,
            served_by,
            failures,
            elapsed: started.elapsed(),
        })
    }

    /// Per-provider breaker state, token level and recent outcomes, in the
    /// current priority order. Each field is one short read under its own lock.
    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.read_order()
            .into_iter()
            .map(|i| self.slots[i].health())
            .collect()
    }

    pub fn reliability_ranks(&self) -> RankSnapshot {
        self.graph.compute_ranks()
    }

    /// Runs the provider's health check through its breaker and bucket.
    pub async fn probe(
        &self,
        provider_id: &ProviderId,
        options: &CallOptions,
    ) -> Result<(), AttemptError> {
        let slot = self.slot(provider_id).ok_or(AttemptError::UnknownProvider)?;
        if !slot.supports(Operation::HealthCheck) {
            return Err(ConnectorError::Unsupported(Operation::HealthCheck).into());
        }
        let result = slot.probe(options).await;
        match &result {
            Ok(()) => tracing::info!(provider = %provider_id, "Health check passed"),
            Err(e) => tracing::warn!(provider = %provider_id, error = %e, "Health check failed"),
        }
        result
    }

    /// Probes every provider that declares a health check, concurrently.
    pub async fn probe_all(&self, options: &CallOptions) -> Vec<(ProviderId, Result<(), AttemptError>)> {
        let probes = self
            .slots
            .iter()
            .filter(|slot| slot.supports(Operation::HealthCheck))
            .map(|slot| async move { (slot.id().clone(), slot.probe(options).await) });
        join_all(probes).await
    }

    /// Recomputes the candidate order according to the rank policy.
    pub fn refresh_ordering(&self) {
        let next = match self.config.rank_policy {
            RankPolicy::Static => self.static_order.clone(),
            RankPolicy::Blended { weight, .. } => {
                let ranks = self.graph.compute_ranks();
                blended_order(&self.slots, &self.static_order, &ranks, weight.clamp(0.0, 1.0))
            }
        };

        let mut order = match self.order.write() {
            Ok(order) => order,
            Err(poisoned) => {
                tracing::warn!("Recovered from poisoned priority order lock");
                poisoned.into_inner()
            }
        };
        if *order != next {
            tracing::info!(
                order = ?next.iter().map(|&i| self.slots[i].id().to_string()).collect::<Vec<_>>(),
                "Priority order updated"
            );
            *order = next;
        }
    }

    /// Spawns a task that calls [`refresh_ordering`](Self::refresh_ordering)
    /// on the blended policy's cadence until `cancel` fires. Returns `None`
    /// under the static policy.
    pub fn spawn_rank_refresher(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let RankPolicy::Blended { refresh, .. } = self.config.rank_policy else {
            return None;
        };
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(refresh) => manager.refresh_ordering(),
                    () = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Rank refresher stopped");
        }))
    }

    /// Breaker state of one provider, for callers that want to pre-filter.
    pub fn breaker_state(&self, provider_id: &ProviderId) -> Option<CircuitState> {
        self.slot(provider_id).map(|slot| slot.breaker.state())
    }
}
