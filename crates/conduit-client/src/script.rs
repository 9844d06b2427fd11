//! Connector backed by an external program.
//!
//! The program receives one JSON request on stdin, e.g.
//! `{"op":"search","query":"berserk","page":1}` or `{"op":"health_check"}`,
//! and answers on stdout with one of:
//!
//! ```json
//! {"items": [{"id": "12", "title": "Berserk", "year": 1989}]}
//! {"error": {"class": "rate_limited_by_provider", "message": "slow down", "retry_after_secs": 30}}
//! {"ok": true}
//! ```
//!
//! A non-zero exit is a transient failure; anything unreadable on stdout is a
//! parse failure.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{
    Connector, ConnectorError, ErrorClass, ListEntry, Operation, ProviderDescriptor, Request,
    SearchItem, SubEntry,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::definition::ScriptProviderConfig;
use crate::items::{self, RawItem};

const STDERR_TAIL: usize = 512;

#[derive(Debug, Deserialize)]
struct ScriptReply {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<ScriptFailure>,
    #[serde(default)]
    ok: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ScriptFailure {
    class: ErrorClass,
    #[serde(default)]
    message: String,
    #[serde(default)]
    retry_after_secs: Option<u64>,
}

impl ScriptFailure {
    fn into_error(self, operation: Operation) -> ConnectorError {
        match self.class {
            ErrorClass::TransientNetwork => ConnectorError::TransientNetwork(self.message),
            ErrorClass::Timeout => {
                ConnectorError::Timeout(Duration::from_secs(self.retry_after_secs.unwrap_or(0)))
            }
            ErrorClass::RateLimitedByProvider | ErrorClass::RateLimitedLocally => {
                ConnectorError::RateLimited {
                    retry_after: self.retry_after_secs.map(Duration::from_secs),
                }
            }
            ErrorClass::BlockedOrBanned => ConnectorError::Blocked(self.message),
            ErrorClass::ParseError => ConnectorError::Parse(self.message),
            ErrorClass::UnsupportedOperation => ConnectorError::Unsupported(operation),
        }
    }
}

pub struct ScriptConnector {
    descriptor: ProviderDescriptor,
    config: ScriptProviderConfig,
}

impl ScriptConnector {
    pub fn new(config: ScriptProviderConfig) -> Self {
        Self {
            descriptor: config.descriptor(),
            config,
        }
    }

    /// Runs the program once. The child is killed if the future is dropped.
    async fn run(&self, input: &Value, operation: Operation) -> Result<ScriptReply, ConnectorError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ConnectorError::TransientNetwork(format!(
                    "Failed to start '{}': {e}",
                    self.config.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let bytes = serde_json::to_vec(input)
                .map_err(|e| ConnectorError::Parse(format!("Failed to encode request: {e}")))?;
            match stdin.write_all(&bytes).await {
                Ok(()) => {}
                // The program answered without reading its input.
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(ConnectorError::TransientNetwork(format!(
                        "Failed to write request: {e}"
                    )));
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("Script failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            tracing::debug!(
                provider = %self.descriptor.id,
                operation = %operation,
                status = %output.status,
                stderr = %tail.trim(),
                "Script exited with failure"
            );
            return Err(ConnectorError::TransientNetwork(format!(
                "Script exited with {}",
                output.status
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ConnectorError::Parse(format!("Invalid script reply: {e}")))
    }

    async fn fetch_items(&self, request: &Request) -> Result<Vec<RawItem>, ConnectorError> {
        let operation = request.operation();
        let input = serde_json::to_value(request)
            .map_err(|e| ConnectorError::Parse(format!("Failed to encode request: {e}")))?;
        let reply = self.run(&input, operation).await?;

        if let Some(failure) = reply.error {
            return Err(failure.into_error(operation));
        }
        let entries = reply
            .items
            .ok_or_else(|| ConnectorError::Parse("Script reply has no `items`".into()))?;
        entries
            .iter()
            .map(|entry| items::raw_item(entry, "id", "title"))
            .collect()
    }
}

#[async_trait]
impl Connector for ScriptConnector {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchItem>, ConnectorError> {
        let raw = self.fetch_items(&Request::search(query, page)).await?;
        Ok(items::to_search(&self.descriptor.id, raw))
    }

    async fn list_items(&self, parent_id: &str) -> Result<Vec<ListEntry>, ConnectorError> {
        let raw = self.fetch_items(&Request::list_items(parent_id)).await?;
        Ok(items::to_entries(&self.descriptor.id, raw))
    }

    async fn list_sub_items(&self, entry_id: &str) -> Result<Vec<SubEntry>, ConnectorError> {
        let raw = self.fetch_items(&Request::list_sub_items(entry_id)).await?;
        Ok(items::to_sub_entries(&self.descriptor.id, raw))
    }

    async fn health_check(&self) -> Result<(), ConnectorError> {
        let input = serde_json::json!({ "op": "health_check" });
        let reply = self.run(&input, Operation::HealthCheck).await?;
        if let Some(failure) = reply.error {
            return Err(failure.into_error(Operation::HealthCheck));
        }
        match reply.ok {
            Some(true) => Ok(()),
            _ => Err(ConnectorError::Parse("Health reply is not `{\"ok\": true}`".into())),
        }
    }
}
