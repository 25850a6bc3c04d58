mod blob;
mod file;
mod object;
mod remote;

use anyhow::Context;
use shared_types::{Document, DocumentEnvelope, EnvelopeHeader, RegistryKey};
use std::sync::Arc;

pub use blob::BlobStore;
pub use file::FileStore;
pub use object::ObjectStoreBackend;
pub use remote::RemoteProxyStore;

use crate::config::{BackendConfig, BackendKind};
use crate::error::{RegistryError, Result};
use crate::version::VersionGate;
use crate::{Revision, StorageBackend, WriteCondition};

/// Build the backend described by `config`. The only place that dispatches on the backend type.
pub fn build(
    config: &BackendConfig,
    gate: Arc<VersionGate>,
) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let name = config.name.clone();
    let backend: Arc<dyn StorageBackend> = match &config.kind {
        BackendKind::File { root } => Arc::new(FileStore::new(name, root, gate)),
        BackendKind::Blob {
            container_url,
            sas_token,
        } => Arc::new(
            BlobStore::new(name, container_url, sas_token.clone(), gate)
                .with_context(|| format!("Failed to configure blob backend {}", config.name))?,
        ),
        BackendKind::Object { store } => Arc::new(
            ObjectStoreBackend::from_config(name, store, gate)
                .with_context(|| format!("Failed to configure object backend {}", config.name))?,
        ),
        BackendKind::Remote { base_url, token } => Arc::new(
            RemoteProxyStore::new(name, base_url, token.clone(), gate)
                .with_context(|| format!("Failed to configure remote backend {}", config.name))?,
        ),
    };
    Ok(backend)
}

/// `namespace/name[/support].json`
pub(crate) fn object_name(key: &RegistryKey) -> String {
    format!("{}.json", key.to_storage_path())
}

/// Decode a document whose version travels inline in a [`DocumentEnvelope`].
pub(crate) fn decode_envelope(
    gate: &VersionGate,
    key: &RegistryKey,
    bytes: &[u8],
) -> Result<Document> {
    let header: EnvelopeHeader =
        serde_json::from_slice(bytes).map_err(|e| RegistryError::corrupt(key, e))?;
    gate.check_stored(key, &header.api_version)?;

    let envelope: DocumentEnvelope =
        serde_json::from_slice(bytes).map_err(|e| RegistryError::corrupt(key, e))?;
    Ok(envelope.into_document())
}

/// Decode bare content bytes whose version was stored as sidecar metadata.
pub(crate) fn decode_content(
    gate: &VersionGate,
    key: &RegistryKey,
    version: Option<&str>,
    bytes: &[u8],
) -> Result<Document> {
    let version = version.ok_or_else(|| RegistryError::corrupt(key, "missing version metadata"))?;
    gate.check_stored(key, version)?;

    let content: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| RegistryError::corrupt(key, e))?;
    Ok(Document::new(version, content))
}

/// Check a write condition against the revision currently stored, for
/// backends that evaluate conditions themselves.
pub(crate) fn ensure_condition(
    key: &RegistryKey,
    condition: &WriteCondition,
    current: Option<&Revision>,
) -> Result<()> {
    match (condition, current) {
        (WriteCondition::Unconditional, _) | (WriteCondition::Absent, None) => Ok(()),
        (WriteCondition::Matches(expected), Some(actual)) if expected == actual => Ok(()),
        (condition, actual) => Err(RegistryError::precondition(
            key,
            condition.describe(),
            actual.map_or_else(|| "none".to_string(), ToString::to_string),
        )),
    }
}
