use async_trait::async_trait;

use crate::error::ConnectorError;
use crate::models::{ListEntry, Operation, Payload, ProviderDescriptor, Request, SearchItem, SubEntry};

/// Adapter around one external provider.
///
/// Implementations translate provider-specific responses into the normalized
/// result types and classify every failure into a [`ConnectorError`]. An empty
/// list is a successful answer, not an error.
///
/// Operations a connector does not implement fall back to
/// [`ConnectorError::Unsupported`].
#[async_trait]
pub trait Connector: Send + Sync {
    /// Registration data: id, capabilities, rate envelope and priority.
    fn descriptor(&self) -> &ProviderDescriptor;

    async fn search(&self, query: &str, page: u32) -> Result<Vec<SearchItem>, ConnectorError> {
        let _ = (query, page);
        Err(ConnectorError::Unsupported(Operation::Search))
    }

    async fn list_items(&self, parent_id: &str) -> Result<Vec<ListEntry>, ConnectorError> {
        let _ = parent_id;
        Err(ConnectorError::Unsupported(Operation::ListItems))
    }

    async fn list_sub_items(&self, entry_id: &str) -> Result<Vec<SubEntry>, ConnectorError> {
        let _ = entry_id;
        Err(ConnectorError::Unsupported(Operation::ListSubItems))
    }

    /// Cheap liveness probe for providers declaring the `health_check` capability.
    async fn health_check(&self) -> Result<(), ConnectorError> {
        Err(ConnectorError::Unsupported(Operation::HealthCheck))
    }
}

/// Dispatches a logical request to the matching connector operation.
pub async fn invoke(connector: &dyn Connector, request: &Request) -> Result<Payload, ConnectorError> {
    match request {
        Request::Search { query, page } => connector.search(query, *page).await.map(Payload::Search),
        Request::ListItems { parent_id } => connector.list_items(parent_id).await.map(Payload::Items),
        Request::ListSubItems { entry_id } => {
            connector.list_sub_items(entry_id).await.map(Payload::SubItems)
        }
    }
}
