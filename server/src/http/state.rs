use std::collections::HashSet;
use std::sync::Arc;
use storage_backend::Registry;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<Registry>,
    pub access: AccessPolicy,
}

impl AppState {
    pub fn new(registry: Registry, access: AccessPolicy) -> Self {
        Self {
            registry: Arc::new(registry),
            access,
        }
    }
}

/// Bearer tokens allowed to reach document routes.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    tokens: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    /// No tokens configured: every caller is allowed.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Decide on the raw `Authorization` header value.
    pub fn allows(&self, authorization: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }

        authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| self.tokens.contains(token.trim()))
    }
}
