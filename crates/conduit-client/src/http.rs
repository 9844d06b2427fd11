use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    AppError, Connector, ConnectorError, ListEntry, Operation, ProviderDescriptor, SearchItem,
    SubEntry,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;

use crate::definition::{Endpoint, HttpProviderConfig};
use crate::items::{self, RawItem};

/// Body fragments anti-bot interstitials are known to carry.
const CHALLENGE_MARKERS: &[&str] = &[
    "captcha",
    "cf-challenge",
    "cf_chl_",
    "just a moment",
    "attention required",
    "access denied",
];

/// Connector for providers exposing JSON over HTTP.
///
/// Every configured endpoint is a URL template; the response body (or the
/// array at `items_pointer`) is turned into normalized items using the
/// endpoint's id/title fields. Remaining object fields travel in `extra`.
pub struct HttpConnector {
    descriptor: ProviderDescriptor,
    config: HttpProviderConfig,
    client: Client,
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: HttpProviderConfig, timeout: Duration) -> Result<Self, AppError> {
        for endpoint in [&config.search, &config.list_items, &config.list_sub_items]
            .into_iter()
            .flatten()
        {
            let sample = render_template(&endpoint.url, "probe", 1, "probe");
            Url::parse(&sample).map_err(|e| {
                AppError::ConfigError(format!(
                    "Invalid URL template '{}' for '{}': {e}",
                    endpoint.url, config.id
                ))
            })?;
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AppError::ConfigError(format!("Invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                AppError::ConfigError(format!("Invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            descriptor: config.descriptor(),
            config,
            client,
            timeout,
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ConnectorError> {
        self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout(self.timeout)
            } else if e.is_connect() {
                ConnectorError::TransientNetwork(format!("Connection failed: {e}"))
            } else {
                ConnectorError::TransientNetwork(e.to_string())
            }
        })
    }

    async fn fetch_items(
        &self,
        endpoint: &Endpoint,
        query: &str,
        page: u32,
        id: &str,
    ) -> Result<Vec<RawItem>, ConnectorError> {
        let url = render_template(&endpoint.url, query, page, id);
        let response = self.get(&url).await?;
        let status = response.status();

        // Missing parent or entry: the provider simply has nothing.
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(provider = %self.descriptor.id, url = %url, "404, treating as empty");
            return Ok(Vec::new());
        }
        if let Some(err) = classify_status(status, response.headers()) {
            return Err(err);
        }

        let body = response
            .text()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("Failed to read response body: {e}")))?;

        let items = extract_items(&body, endpoint)?;
        tracing::debug!(
            provider = %self.descriptor.id,
            url = %url,
            items = items.len(),
            "Fetched"
        );
        Ok(items)
    }

    fn endpoint<'a>(
        endpoint: &'a Option<Endpoint>,
        op: Operation,
    ) -> Result<&'a Endpoint, ConnectorError> {
        endpoint.as_ref().ok_or(ConnectorError::Unsupported(op))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchItem>, ConnectorError> {
        let endpoint = Self::endpoint(&self.config.search, Operation::Search)?;
        let raw = self.fetch_items(endpoint, query, page, "").await?;
        Ok(items::to_search(&self.descriptor.id, raw))
    }

    async fn list_items(&self, parent_id: &str) -> Result<Vec<ListEntry>, ConnectorError> {
        let endpoint = Self::endpoint(&self.config.list_items, Operation::ListItems)?;
        let raw = self.fetch_items(endpoint, "", 1, parent_id).await?;
        Ok(items::to_entries(&self.descriptor.id, raw))
    }

    async fn list_sub_items(&self, entry_id: &str) -> Result<Vec<SubEntry>, ConnectorError> {
        let endpoint = Self::endpoint(&self.config.list_sub_items, Operation::ListSubItems)?;
        let raw = self.fetch_items(endpoint, "", 1, entry_id).await?;
        Ok(items::to_sub_entries(&self.descriptor.id, raw))
    }

    async fn health_check(&self) -> Result<(), ConnectorError> {
        let Some(url) = &self.config.health_url else {
            return Err(ConnectorError::Unsupported(Operation::HealthCheck));
        };
        let response = self.get(url).await?;
        match classify_status(response.status(), response.headers()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Substitutes `{query}`, `{page}` and `{id}`, form-encoding the text values.
fn render_template(template: &str, query: &str, page: u32, id: &str) -> String {
    let encode = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
    template
        .replace("{query}", &encode(query))
        .replace("{page}", &page.to_string())
        .replace("{id}", &encode(id))
}

/// Maps a non-success status to a connector error. `None` means success.
fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<ConnectorError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    let err = match status {
        StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited {
            retry_after: retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ConnectorError::Blocked(format!("HTTP {code}"))
        }
        s if s.is_server_error() => ConnectorError::TransientNetwork(format!("HTTP {code}")),
        _ => ConnectorError::Parse(format!("Unexpected HTTP {code}")),
    };
    Some(err)
}

/// Retry-After in delta-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn looks_like_challenge(body: &str) -> bool {
    let head: String = body.chars().take(4096).collect::<String>().to_lowercase();
    head.trim_start().starts_with('<') && CHALLENGE_MARKERS.iter().any(|m| head.contains(m))
}

fn extract_items(body: &str, endpoint: &Endpoint) -> Result<Vec<RawItem>, ConnectorError> {
    let json: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) if looks_like_challenge(body) => {
            return Err(ConnectorError::Blocked("Anti-bot challenge page".into()));
        }
        Err(e) => return Err(ConnectorError::Parse(format!("Invalid JSON: {e}"))),
    };

    let list = if endpoint.items_pointer.is_empty() {
        &json
    } else {
        json.pointer(&endpoint.items_pointer).ok_or_else(|| {
            ConnectorError::Parse(format!("Nothing at '{}'", endpoint.items_pointer))
        })?
    };
    let Value::Array(entries) = list else {
        return Err(ConnectorError::Parse("Expected a JSON array of items".into()));
    };

    entries
        .iter()
        .map(|entry| items::raw_item(entry, &endpoint.id_field, &endpoint.title_field))
        .collect()
}
