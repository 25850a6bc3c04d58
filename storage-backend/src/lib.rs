pub mod backend;
pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod version;


use async_trait::async_trait;
use shared_types::{Document, RegistryKey};
use std::fmt;

pub use backend::{BlobStore, FileStore, ObjectStoreBackend, RemoteProxyStore};
pub use config::{BackendConfig, BackendKind, ObjectStoreConfig};
pub use error::{RegistryError, Result};
pub use registry::{LoadedDocument, Precondition, Registry, SaveOutcome};
pub use router::{BackendRouter, RouteResolved};
pub use version::VersionGate;

/// Backend-native marker for the stored representation observed on load:
/// a file digest, an object or blob ETag, or a peer's entity tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(pub String);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Native precondition attached to a write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    Unconditional,
    Absent,
    Matches(Revision),
}

impl WriteCondition {
    pub fn from_current(current: Option<&StoredDocument>) -> Self {
        match current {
            Some(stored) => Self::Matches(stored.revision.clone()),
            None => Self::Absent,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Unconditional => "any".to_string(),
            Self::Absent => "none".to_string(),
            Self::Matches(revision) => revision.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub document: Document,
    pub revision: Revision,
}

/// Caller-supplied mutation run while a backend holds exclusive access.
/// Returning `Ok(None)` leaves the stored document untouched.
pub type Transform = Box<dyn FnOnce(Document) -> anyhow::Result<Option<Document>> + Send>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(false)` for a clean absence; errors only for backend failures.
    async fn exists(&self, key: &RegistryKey) -> Result<bool>;

    /// Load the stored document, gating its version tag before the content is parsed.
    async fn load(&self, key: &RegistryKey) -> Result<StoredDocument>;

    /// Store `document` stamped with the server's version.
    ///
    /// # Errors
    /// Returns `RegistryError::PreconditionFailed` when `condition` no longer
    /// holds at the backend, without writing anything.
    async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        condition: &WriteCondition,
    ) -> Result<()>;

    /// Remove the document. Absence is reported as `RegistryError::NotFound`.
    async fn delete(&self, key: &RegistryKey, condition: &WriteCondition) -> Result<()>;

    /// Acquire exclusive access, run `transform` on the current document and
    /// store its replacement, releasing access on every exit path.
    async fn modify_exclusive(&self, key: &RegistryKey, transform: Transform) -> Result<Document> {
        let _ = (key, transform);
        Err(RegistryError::ExclusiveAccessUnsupported(
            self.name().to_string(),
        ))
    }
}
