use serde::{Deserialize, Serialize};
use shared_types::RegistryKey;

/// Path parameters of the document routes
#[derive(Debug, Deserialize)]
pub struct KeyPath {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub support: Option<String>,
}

impl From<KeyPath> for RegistryKey {
    fn from(path: KeyPath) -> Self {
        let key = RegistryKey::new(path.registry, path.namespace, path.name);
        match path.support {
            Some(support) => key.with_support(support),
            None => key,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoadParams {
    /// Return a fresh document instead of 404 when nothing is stored
    #[serde(default)]
    pub ensure: bool,
}

/// Response for a successful save
#[derive(Debug, Serialize, Deserialize)]
pub struct SaveResponse {
    pub key: String,
    pub token: String,
    /// `false` when the stored content was already identical
    pub changed: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}
