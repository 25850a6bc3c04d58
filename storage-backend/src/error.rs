use shared_types::KeyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No backend matched key: {0}")]
    NoBackendMatched(String),

    #[error("Configuration not found: {0}")]
    NotFound(String),

    #[error("Precondition failed for {key}: expected {expected}, but found {actual}")]
    PreconditionFailed {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Version {found} is newer than server version {server}")]
    VersionIncompatible { found: String, server: String },

    #[error("Corrupt document at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Backend {backend} unavailable: {source}")]
    BackendUnavailable {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Invalid version {version:?}: {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Backend {0} does not support exclusive access")]
    ExclusiveAccessUnsupported(String),

    #[error("Transform failed: {0}")]
    TransformFailed(#[source] anyhow::Error),
}

impl RegistryError {
    pub fn unavailable(backend: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            source: source.into(),
        }
    }

    pub fn corrupt(key: impl ToString, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn precondition(
        key: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::PreconditionFailed {
            key: key.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Errors raised inside a caller transform keep their registry meaning
    /// when they already carry one.
    pub fn from_transform(err: anyhow::Error) -> Self {
        match err.downcast::<RegistryError>() {
            Ok(inner) => inner,
            Err(other) => Self::TransformFailed(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
