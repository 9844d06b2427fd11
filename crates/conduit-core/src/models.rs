use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable short identifier of a provider (e.g. `"mangadex"`).
///
/// Cheap to clone; shared across results, breakers and the reliability graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Arc<str>);

impl ProviderId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical operation a caller can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    ListItems,
    ListSubItems,
    HealthCheck,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::ListItems => "list_items",
            Operation::ListSubItems => "list_sub_items",
            Operation::HealthCheck => "health_check",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" => Ok(Operation::Search),
            "list_items" => Ok(Operation::ListItems),
            "list_sub_items" => Ok(Operation::ListSubItems),
            "health_check" => Ok(Operation::HealthCheck),
            _ => Err(format!("Unknown operation: {}", s)),
        }
    }
}

/// Operations a connector declares it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub search: bool,
    pub list_items: bool,
    pub list_sub_items: bool,
    pub health_check: bool,
}

impl Capabilities {
    pub const fn all() -> Self {
        Self {
            search: true,
            list_items: true,
            list_sub_items: true,
            health_check: true,
        }
    }

    pub const fn search_only() -> Self {
        Self {
            search: true,
            list_items: false,
            list_sub_items: false,
            health_check: false,
        }
    }

    pub fn supports(&self, operation: Operation) -> bool {
        match operation {
            Operation::Search => self.search,
            Operation::ListItems => self.list_items,
            Operation::ListSubItems => self.list_sub_items,
            Operation::HealthCheck => self.health_check,
        }
    }

    pub fn with(mut self, operation: Operation) -> Self {
        match operation {
            Operation::Search => self.search = true,
            Operation::ListItems => self.list_items = true,
            Operation::ListSubItems => self.list_sub_items = true,
            Operation::HealthCheck => self.health_check = true,
        }
        self
    }
}

/// Token bucket envelope a provider tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Sustained rate in requests per second.
    pub per_second: f64,
    /// Maximum burst size.
    pub burst: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_second: 1.0,
            burst: 3,
        }
    }
}

impl RateConfig {
    pub fn new(per_second: f64, burst: u32) -> Self {
        Self { per_second, burst }
    }

    /// Rejects envelopes a token bucket cannot pace.
    pub fn validate(&self) -> Result<(), String> {
        if !self.per_second.is_finite() || self.per_second <= 0.0 {
            return Err(format!(
                "per_second must be a positive finite number, got {}",
                self.per_second
            ));
        }
        if self.burst == 0 {
            return Err("burst must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Static registration data every connector provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub display_name: String,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub rate: RateConfig,
    /// Higher is tried earlier. Seeds the static priority order.
    #[serde(default)]
    pub priority_weight: i32,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<ProviderId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            capabilities: Capabilities::search_only(),
            rate: RateConfig::default(),
            priority_weight: 0,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_rate(mut self, rate: RateConfig) -> Self {
        self.rate = rate;
        self
    }

    pub fn with_priority(mut self, weight: i32) -> Self {
        self.priority_weight = weight;
        self
    }
}

/// A search hit from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    pub provider_id: ProviderId,
    pub external_id: String,
    pub display_title: String,
    /// Provider-opaque fields consumed by later stages.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// An item listed under a parent (e.g. a chapter of a series).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub provider_id: ProviderId,
    pub external_id: String,
    pub display_title: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// A sub-item of a listed entry (e.g. a page of a chapter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEntry {
    pub provider_id: ProviderId,
    pub external_id: String,
    pub display_title: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

/// One logical request, independent of the provider that will answer it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Search { query: String, page: u32 },
    ListItems { parent_id: String },
    ListSubItems { entry_id: String },
}

impl Request {
    pub fn search(query: impl Into<String>, page: u32) -> Self {
        Request::Search {
            query: query.into(),
            page,
        }
    }

    pub fn list_items(parent_id: impl Into<String>) -> Self {
        Request::ListItems {
            parent_id: parent_id.into(),
        }
    }

    pub fn list_sub_items(entry_id: impl Into<String>) -> Self {
        Request::ListSubItems {
            entry_id: entry_id.into(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Request::Search { .. } => Operation::Search,
            Request::ListItems { .. } => Operation::ListItems,
            Request::ListSubItems { .. } => Operation::ListSubItems,
        }
    }
}

/// Normalized result of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum Payload {
    Search(Vec<SearchItem>),
    Items(Vec<ListEntry>),
    SubItems(Vec<SubEntry>),
}

impl Payload {
    /// An empty payload of the kind `operation` produces.
    pub fn empty_for(operation: Operation) -> Self {
        match operation {
            Operation::ListItems => Payload::Items(Vec::new()),
            Operation::ListSubItems => Payload::SubItems(Vec::new()),
            Operation::Search | Operation::HealthCheck => Payload::Search(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Search(items) => items.len(),
            Payload::Items(items) => items.len(),
            Payload::SubItems(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `other` if it is the same kind. Returns false (and drops
    /// nothing from `self`) when the kinds differ.
    pub fn append(&mut self, other: Payload) -> bool {
        match (self, other) {
            (Payload::Search(a), Payload::Search(b)) => a.extend(b),
            (Payload::Items(a), Payload::Items(b)) => a.extend(b),
            (Payload::SubItems(a), Payload::SubItems(b)) => a.extend(b),
            _ => return false,
        }
        true
    }

    pub fn as_search(&self) -> Option<&[SearchItem]> {
        match self {
            Payload::Search(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&[ListEntry]> {
        match self {
            Payload::Items(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_sub_items(&self) -> Option<&[SubEntry]> {
        match self {
            Payload::SubItems(items) => Some(items),
            _ => None,
        }
    }
}
