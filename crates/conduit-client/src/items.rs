use conduit_core::{ConnectorError, ListEntry, ProviderId, SearchItem, SubEntry};
use serde_json::Value;

/// Provider-agnostic item before it is typed for an operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawItem {
    pub external_id: String,
    pub display_title: String,
    pub extra: Value,
}

pub(crate) fn to_search(provider: &ProviderId, items: Vec<RawItem>) -> Vec<SearchItem> {
    items
        .into_iter()
        .map(|i| SearchItem {
            provider_id: provider.clone(),
            external_id: i.external_id,
            display_title: i.display_title,
            extra: i.extra,
        })
        .collect()
}

pub(crate) fn to_entries(provider: &ProviderId, items: Vec<RawItem>) -> Vec<ListEntry> {
    items
        .into_iter()
        .map(|i| ListEntry {
            provider_id: provider.clone(),
            external_id: i.external_id,
            display_title: i.display_title,
            extra: i.extra,
        })
        .collect()
}

pub(crate) fn to_sub_entries(provider: &ProviderId, items: Vec<RawItem>) -> Vec<SubEntry> {
    items
        .into_iter()
        .map(|i| SubEntry {
            provider_id: provider.clone(),
            external_id: i.external_id,
            display_title: i.display_title,
            extra: i.extra,
        })
        .collect()
}

/// Reads an id that may be a JSON string or number.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads one JSON object into a [`RawItem`]. The title falls back to the id;
/// every other field is kept in `extra`.
pub(crate) fn raw_item(entry: &Value, id_field: &str, title_field: &str) -> Result<RawItem, ConnectorError> {
    let Value::Object(fields) = entry else {
        return Err(ConnectorError::Parse("Item is not a JSON object".into()));
    };
    let external_id = fields
        .get(id_field)
        .and_then(scalar_to_string)
        .ok_or_else(|| ConnectorError::Parse(format!("Item missing field `{id_field}`")))?;
    let display_title = fields
        .get(title_field)
        .and_then(scalar_to_string)
        .unwrap_or_else(|| external_id.clone());

    let mut extra = fields.clone();
    extra.remove(id_field);
    extra.remove(title_field);

    Ok(RawItem {
        external_id,
        display_title,
        extra: Value::Object(extra),
    })
}
