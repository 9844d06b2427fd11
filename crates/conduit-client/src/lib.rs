pub mod definition;
pub mod http;
mod items;
pub mod script;

pub use definition::{Endpoint, HttpProviderConfig, ProviderDefinition, ScriptProviderConfig};
pub use http::HttpConnector;
pub use script::ScriptConnector;
