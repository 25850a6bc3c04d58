use anyhow::Context;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use shared_types::RegistryKey;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{RegistryError, Result};
use crate::StorageBackend;

const EVENT_CAPACITY: usize = 64;

/// Emitted each time a key resolves to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResolved {
    pub key: RegistryKey,
    pub backend: String,
}

struct Route {
    patterns: GlobSet,
    backend: Arc<dyn StorageBackend>,
}

/// Ordered route table. The first backend with a pattern matching the
/// flattened key owns it; there is no implicit default.
pub struct BackendRouter {
    routes: Vec<Route>,
    events: broadcast::Sender<RouteResolved>,
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRouter {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            routes: Vec::new(),
            events,
        }
    }

    /// Append a backend after every route added so far.
    ///
    /// `*` matches within one path segment and `**` across segments.
    pub fn add_route<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
        backend: Arc<dyn StorageBackend>,
    ) -> anyhow::Result<()> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .with_context(|| {
                    format!("Invalid pattern {pattern:?} for backend {}", backend.name())
                })?;
            builder.add(glob);
        }

        self.routes.push(Route {
            patterns: builder.build()?,
            backend,
        });
        Ok(())
    }

    pub fn with_route<S: AsRef<str>>(
        mut self,
        patterns: &[S],
        backend: Arc<dyn StorageBackend>,
    ) -> anyhow::Result<Self> {
        self.add_route(patterns, backend)?;
        Ok(self)
    }

    pub fn resolve(&self, key: &RegistryKey) -> Result<Arc<dyn StorageBackend>> {
        let path = key.to_route_path();
        let route = self
            .routes
            .iter()
            .find(|route| route.patterns.is_match(&path))
            .ok_or_else(|| RegistryError::NoBackendMatched(path.clone()))?;

        let backend = route.backend.name().to_string();
        debug!("Routed {} to backend {}", path, backend);
        // Nobody listening is fine
        let _ = self.events.send(RouteResolved {
            key: key.clone(),
            backend,
        });

        Ok(route.backend.clone())
    }

    /// Observe routing decisions. Slow receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<RouteResolved> {
        self.events.subscribe()
    }

    pub fn backend_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.backend.name())
    }
}
