use shared_types::{ConcurrencyToken, Document, RegistryKey};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

use crate::backend;
use crate::config::BackendConfig;
use crate::error::{RegistryError, Result};
use crate::router::{BackendRouter, RouteResolved};
use crate::version::VersionGate;
use crate::{StorageBackend, StoredDocument, Transform, WriteCondition};

/// What the caller believes is currently stored, in the manner of `If-Match`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional write.
    Any,
    /// Nothing may be stored yet.
    Absent,
    /// Something must be stored, whatever its content.
    Exists,
    /// The stored document must hash to this token.
    Matches(ConcurrencyToken),
}

impl Precondition {
    fn describe(&self) -> String {
        match self {
            Self::Any => "any".to_string(),
            Self::Absent => "none".to_string(),
            Self::Exists => "any existing".to_string(),
            Self::Matches(token) => token.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub document: Document,
    /// `None` when the document was created on the fly by an ensuring load.
    pub token: Option<ConcurrencyToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Written(ConcurrencyToken),
    /// Content was already stored; the backend was not called.
    Unchanged(ConcurrencyToken),
}

impl SaveOutcome {
    pub fn token(&self) -> &ConcurrencyToken {
        match self {
            Self::Written(token) | Self::Unchanged(token) => token,
        }
    }
}

/// An undeclared version means the caller speaks the server's own version.
fn check_declared(gate: &VersionGate, document: &Document) -> Result<()> {
    if document.api_version.is_empty() {
        gate.check(gate.server_version())
    } else {
        gate.check(&document.api_version)
    }
}

/// Entry point for document operations: routes each key to its backend and
/// applies version and precondition checks the same way for every backend.
pub struct Registry {
    router: BackendRouter,
    gate: Arc<VersionGate>,
}

impl Registry {
    pub fn new(router: BackendRouter, gate: Arc<VersionGate>) -> Self {
        Self { router, gate }
    }

    pub fn from_config(configs: &[BackendConfig], server_version: &str) -> anyhow::Result<Self> {
        let gate = Arc::new(VersionGate::new(server_version)?);
        let mut router = BackendRouter::new();
        for config in configs {
            let backend = backend::build(config, gate.clone())?;
            router.add_route(&config.patterns, backend)?;
            info!(
                "Registered backend {} for patterns {:?}",
                config.name, config.patterns
            );
        }
        Ok(Self::new(router, gate))
    }

    pub fn gate(&self) -> &VersionGate {
        &self.gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteResolved> {
        self.router.subscribe()
    }

    fn backend_for(&self, key: &RegistryKey) -> Result<Arc<dyn StorageBackend>> {
        key.validate()?;
        self.router.resolve(key)
    }

    async fn current(
        backend: &dyn StorageBackend,
        key: &RegistryKey,
    ) -> Result<Option<StoredDocument>> {
        match backend.load(key).await {
            Ok(stored) => Ok(Some(stored)),
            Err(RegistryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn check_precondition(
        key: &RegistryKey,
        precondition: &Precondition,
        current: Option<&ConcurrencyToken>,
    ) -> Result<()> {
        let satisfied = match (precondition, current) {
            (Precondition::Any, _)
            | (Precondition::Absent, None)
            | (Precondition::Exists, Some(_)) => true,
            (Precondition::Matches(expected), Some(actual)) => expected == actual,
            _ => false,
        };

        if satisfied {
            Ok(())
        } else {
            Err(RegistryError::precondition(
                key,
                precondition.describe(),
                current.map_or_else(|| "none".to_string(), ToString::to_string),
            ))
        }
    }

    #[instrument(skip(self))]
    pub async fn exists(&self, key: &RegistryKey) -> Result<bool> {
        let backend = self.backend_for(key)?;
        backend.exists(key).await
    }

    /// Load a document. A missing document is `NotFound` unless
    /// `ensure_if_missing` asks for a fresh one stamped with the server version.
    #[instrument(skip(self))]
    pub async fn load(
        &self,
        key: &RegistryKey,
        ensure_if_missing: bool,
    ) -> Result<LoadedDocument> {
        let backend = self.backend_for(key)?;

        match Self::current(backend.as_ref(), key).await? {
            Some(stored) => {
                let token = stored.document.token();
                Ok(LoadedDocument {
                    document: stored.document,
                    token: Some(token),
                })
            }
            None if ensure_if_missing => {
                debug!("Config {} missing, returning a fresh document", key);
                Ok(LoadedDocument {
                    document: Document::empty(self.gate.server_version()),
                    token: None,
                })
            }
            None => Err(RegistryError::NotFound(key.to_string())),
        }
    }

    /// Store a document if `precondition` matches what is stored now.
    ///
    /// # Errors
    /// Returns `RegistryError::PreconditionFailed` without writing when the
    /// stored token differs from the expected one, and
    /// `RegistryError::VersionIncompatible` when the document declares a newer
    /// version than the server's.
    #[instrument(skip(self, document))]
    pub async fn save(
        &self,
        key: &RegistryKey,
        document: &Document,
        precondition: &Precondition,
    ) -> Result<SaveOutcome> {
        let backend = self.backend_for(key)?;
        check_declared(&self.gate, document)?;

        let current = Self::current(backend.as_ref(), key).await?;
        let current_token = current.as_ref().map(|stored| stored.document.token());
        Self::check_precondition(key, precondition, current_token.as_ref())?;

        let token = document.token();
        if current_token.as_ref() == Some(&token) {
            debug!("Config {} unchanged, skipping write", key);
            return Ok(SaveOutcome::Unchanged(token));
        }

        let condition = match precondition {
            Precondition::Any => WriteCondition::Unconditional,
            _ => WriteCondition::from_current(current.as_ref()),
        };
        backend.save(key, document, &condition).await?;

        info!("Saved config {} via {}", key, backend.name());
        Ok(SaveOutcome::Written(token))
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &RegistryKey, precondition: &Precondition) -> Result<()> {
        let backend = self.backend_for(key)?;

        let current = Self::current(backend.as_ref(), key)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        Self::check_precondition(key, precondition, Some(&current.document.token()))?;

        let condition = match precondition {
            Precondition::Any => WriteCondition::Unconditional,
            _ => WriteCondition::Matches(current.revision),
        };
        backend.delete(key, &condition).await?;

        info!("Deleted config {} via {}", key, backend.name());
        Ok(())
    }

    /// Run `transform` while the owning backend holds the document exclusively.
    /// Only backends with a native locking primitive support this.
    #[instrument(skip(self, transform))]
    pub async fn modify_exclusive(
        &self,
        key: &RegistryKey,
        transform: Transform,
    ) -> Result<Document> {
        let backend = self.backend_for(key)?;
        let gate = self.gate.clone();

        // Replacements go through the same version check as plain saves
        let transform: Transform = Box::new(move |document| match transform(document)? {
            Some(replacement) => {
                check_declared(&gate, &replacement)?;
                Ok(Some(replacement))
            }
            None => Ok(None),
        });

        backend.modify_exclusive(key, transform).await
    }
}
