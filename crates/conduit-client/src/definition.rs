//! Provider definitions loaded from a JSON file.
//!
//! ```json
//! [
//!   {
//!     "kind": "http",
//!     "id": "mangadex",
//!     "priority_weight": 10,
//!     "rate": { "per_second": 2.0, "burst": 3 },
//!     "search": { "url": "https://api.example.org/search?q={query}&page={page}", "items_pointer": "/data" }
//!   },
//!   { "kind": "script", "id": "legacy", "program": "python3", "args": ["legacy.py"], "capabilities": { "search": true } }
//! ]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conduit_core::{AppError, Capabilities, Connector, ProviderDescriptor, RateConfig};
use serde::{Deserialize, Serialize};

use crate::http::HttpConnector;
use crate::script::ScriptConnector;

fn default_id_field() -> String {
    "id".to_string()
}

fn default_title_field() -> String {
    "title".to_string()
}

/// One HTTP endpoint returning a JSON list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// URL template; `{query}`, `{page}` and `{id}` are substituted, percent-encoded.
    pub url: String,
    /// JSON pointer to the item array; empty means the body itself.
    #[serde(default)]
    pub items_pointer: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_title_field")]
    pub title_field: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            items_pointer: String::new(),
            id_field: default_id_field(),
            title_field: default_title_field(),
        }
    }

    pub fn with_items_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = pointer.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub priority_weight: i32,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub search: Option<Endpoint>,
    #[serde(default)]
    pub list_items: Option<Endpoint>,
    #[serde(default)]
    pub list_sub_items: Option<Endpoint>,
    /// URL answering 2xx when the provider is up.
    #[serde(default)]
    pub health_url: Option<String>,
    /// Extra request headers (API keys, Accept).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl HttpProviderConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            priority_weight: 0,
            rate: RateConfig::default(),
            search: None,
            list_items: None,
            list_sub_items: None,
            health_url: None,
            headers: BTreeMap::new(),
        }
    }

    /// Capabilities follow from which endpoints are configured.
    pub fn descriptor(&self) -> ProviderDescriptor {
        let capabilities = Capabilities {
            search: self.search.is_some(),
            list_items: self.list_items.is_some(),
            list_sub_items: self.list_sub_items.is_some(),
            health_check: self.health_url.is_some(),
        };
        ProviderDescriptor::new(
            self.id.as_str(),
            self.display_name.clone().unwrap_or_else(|| self.id.clone()),
        )
        .with_capabilities(capabilities)
        .with_rate(self.rate)
        .with_priority(self.priority_weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptProviderConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub priority_weight: i32,
    #[serde(default)]
    pub rate: RateConfig,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub capabilities: Capabilities,
}

impl ScriptProviderConfig {
    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(
            self.id.as_str(),
            self.display_name.clone().unwrap_or_else(|| self.id.clone()),
        )
        .with_capabilities(self.capabilities)
        .with_rate(self.rate)
        .with_priority(self.priority_weight)
    }
}

/// Explicit registration entry for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderDefinition {
    Http(HttpProviderConfig),
    Script(ScriptProviderConfig),
}

impl ProviderDefinition {
    pub fn id(&self) -> &str {
        match self {
            ProviderDefinition::Http(c) => &c.id,
            ProviderDefinition::Script(c) => &c.id,
        }
    }

    /// Parses a JSON array of definitions.
    pub fn parse_list(json: &str) -> Result<Vec<Self>, AppError> {
        let definitions: Vec<Self> = serde_json::from_str(json)?;
        for definition in &definitions {
            definition.validate()?;
        }
        Ok(definitions)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Vec<Self>, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let definitions = Self::parse_list(&raw)?;
        tracing::debug!(
            path = %path.display(),
            providers = definitions.len(),
            "Loaded provider definitions"
        );
        Ok(definitions)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.id().trim().is_empty() {
            return Err(AppError::ConfigError("Provider id must not be empty".into()));
        }
        match self {
            ProviderDefinition::Http(c) => {
                let endpoints = [&c.search, &c.list_items, &c.list_sub_items];
                if endpoints.iter().all(|e| e.is_none()) {
                    return Err(AppError::ConfigError(format!(
                        "HTTP provider '{}' defines no endpoints",
                        c.id
                    )));
                }
                for endpoint in endpoints.into_iter().flatten() {
                    if !endpoint.items_pointer.is_empty() && !endpoint.items_pointer.starts_with('/') {
                        return Err(AppError::ConfigError(format!(
                            "Invalid items_pointer '{}' for '{}': must start with '/'",
                            endpoint.items_pointer, c.id
                        )));
                    }
                }
            }
            ProviderDefinition::Script(c) => {
                if c.program.as_os_str().is_empty() {
                    return Err(AppError::ConfigError(format!(
                        "Script provider '{}' has no program",
                        c.id
                    )));
                }
            }
        }
        self.rate().validate().map_err(|reason| {
            AppError::ConfigError(format!("Provider '{}' needs a positive rate: {reason}", self.id()))
        })
    }

    fn rate(&self) -> RateConfig {
        match self {
            ProviderDefinition::Http(c) => c.rate,
            ProviderDefinition::Script(c) => c.rate,
        }
    }

    /// Builds the connector. `timeout` bounds each HTTP request.
    pub fn into_connector(self, timeout: Duration) -> Result<Arc<dyn Connector>, AppError> {
        match self {
            ProviderDefinition::Http(config) => Ok(Arc::new(HttpConnector::new(config, timeout)?)),
            ProviderDefinition::Script(config) => Ok(Arc::new(ScriptConnector::new(config))),
        }
    }
}
