//! Test utilities: a scriptable fake connector.
//!
//! Handwritten fake for dependency injection in unit and integration tests.
//! State lives behind `Arc<Mutex<_>>`, so a clone kept by the test observes
//! the calls made through the clone registered with the manager.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::models::{
    Capabilities, ListEntry, ProviderDescriptor, ProviderId, RateConfig, Request, SearchItem,
    SubEntry,
};
use crate::traits::Connector;

/// Reply for one call: how many items to return, or the error to fail with.
pub type MockReply = Result<usize, ConnectorError>;

#[derive(Debug, Default)]
struct MockState {
    queued: VecDeque<MockReply>,
    requests: Vec<Request>,
    health_checks: usize,
}

/// Connector whose answers are scripted by the test.
///
/// Queued replies are used first, in order; after that every call gets the
/// default reply.
#[derive(Debug, Clone)]
pub struct MockConnector {
    descriptor: ProviderDescriptor,
    default_reply: MockReply,
    health: Result<(), ConnectorError>,
    delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    /// All capabilities, a generous rate envelope, one item per call.
    pub fn new(id: &str) -> Self {
        Self {
            descriptor: ProviderDescriptor::new(id, id.to_uppercase())
                .with_capabilities(Capabilities::all())
                .with_rate(RateConfig::new(1000.0, 1000)),
            default_reply: Ok(1),
            health: Ok(()),
            delay: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Every unqueued call returns `count` items (zero means an empty answer).
    pub fn returning(mut self, count: usize) -> Self {
        self.default_reply = Ok(count);
        self
    }

    /// Every unqueued call fails with `error`.
    pub fn failing(mut self, error: ConnectorError) -> Self {
        self.default_reply = Err(error);
        self
    }

    pub fn with_replies(self, replies: Vec<MockReply>) -> Self {
        self.lock_state().queued.extend(replies);
        self
    }

    pub fn with_priority(mut self, weight: i32) -> Self {
        self.descriptor.priority_weight = weight;
        self
    }

    pub fn with_rate(mut self, rate: RateConfig) -> Self {
        self.descriptor.rate = rate;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.descriptor.capabilities = capabilities;
        self
    }

    /// Each call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_health(mut self, health: Result<(), ConnectorError>) -> Self {
        self.health = health;
        self
    }

    pub fn id(&self) -> &ProviderId {
        &self.descriptor.id
    }

    /// Number of operation calls received (health checks excluded).
    pub fn calls(&self) -> usize {
        self.lock_state().requests.len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock_state().requests.clone()
    }

    pub fn health_checks(&self) -> usize {
        self.lock_state().health_checks
    }

    fn lock_state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn answer(&self, request: Request) -> MockReply {
        let reply = {
            let mut state = self.lock_state();
            state.requests.push(request);
            state
                .queued
                .pop_front()
                .unwrap_or_else(|| self.default_reply.clone())
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

/// A search hit attributed to `provider`.
pub fn search_item(provider: &ProviderId, external_id: &str) -> SearchItem {
    SearchItem {
        provider_id: provider.clone(),
        external_id: external_id.to_string(),
        display_title: format!("{provider} #{external_id}"),
        extra: serde_json::Value::Null,
    }
}

pub fn list_entry(provider: &ProviderId, external_id: &str) -> ListEntry {
    ListEntry {
        provider_id: provider.clone(),
        external_id: external_id.to_string(),
        display_title: format!("{provider} entry {external_id}"),
        extra: serde_json::Value::Null,
    }
}

pub fn sub_entry(provider: &ProviderId, external_id: &str) -> SubEntry {
    SubEntry {
        provider_id: provider.clone(),
        external_id: external_id.to_string(),
        display_title: format!("{provider} page {external_id}"),
        extra: serde_json::Value::Null,
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchItem>, ConnectorError> {
        let count = self.answer(Request::search(query, page)).await?;
        Ok((0..count)
            .map(|i| search_item(self.id(), &i.to_string()))
            .collect())
    }

    async fn list_items(&self, parent_id: &str) -> Result<Vec<ListEntry>, ConnectorError> {
        let count = self.answer(Request::list_items(parent_id)).await?;
        Ok((0..count)
            .map(|i| list_entry(self.id(), &format!("{parent_id}-{i}")))
            .collect())
    }

    async fn list_sub_items(&self, entry_id: &str) -> Result<Vec<SubEntry>, ConnectorError> {
        let count = self.answer(Request::list_sub_items(entry_id)).await?;
        Ok((0..count)
            .map(|i| sub_entry(self.id(), &format!("{entry_id}-{i}")))
            .collect())
    }

    async fn health_check(&self) -> Result<(), ConnectorError> {
        self.lock_state().health_checks += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.health.clone()
    }
}
