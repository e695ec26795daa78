//! Declarations nodes publish to the registry.
//!
//! Field names are PascalCase on the wire. Fields this crate does not model
//! are kept in `extra` and written back out unchanged, so declarations from
//! other implementations survive a round trip through the directory.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// What a provider offers: streams it publishes, services it hosts and the
/// data tree it exposes for path browsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDeclaration {
    /// Unique provider identifier. Registration without one is rejected.
    #[serde(rename = "ProviderID", default)]
    pub provider_id: String,
    /// URL a broker dials to reach this provider.
    #[serde(rename = "ProviderURL", default, skip_serializing_if = "Option::is_none")]
    pub provider_url: Option<String>,
    /// Class definitions, opaque to the mesh.
    #[serde(rename = "Classes", default)]
    pub classes: Map<String, Value>,
    /// Structure description, opaque to the mesh.
    #[serde(rename = "Structure", default)]
    pub structure: Map<String, Value>,
    /// Stream name to description.
    #[serde(rename = "Streams", default)]
    pub streams: BTreeMap<String, Value>,
    /// Service name to declaration.
    #[serde(rename = "Services", default)]
    pub services: BTreeMap<String, ServiceDeclaration>,
    /// Everything else (node roles, zone, scope).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProviderDeclaration {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    /// Whether this provider publishes `topic`.
    pub fn has_stream(&self, topic: &str) -> bool {
        self.streams.contains_key(topic)
    }
}

/// A service hosted by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    /// Command names clients may call through `serviceCommand`.
    #[serde(
        rename = "ClientCmds",
        default,
        deserialize_with = "deserialize_command_names"
    )]
    pub client_cmds: Vec<String>,
    #[serde(rename = "Persistence", default)]
    pub persistence: bool,
    #[serde(rename = "Weight", default)]
    pub weight: u32,
    #[serde(rename = "Zone", default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

/// Accepts either `["a", "b"]` or `{"a": .., "b": ..}`.
fn deserialize_command_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let mut names: Vec<String> = match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
        _ => Vec::new(),
    };
    names.sort();
    Ok(names)
}
