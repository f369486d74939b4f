//! Registry mapping backend kinds to their constructors.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use super::backend::CounterBackend;
use super::memory::MemoryBackend;
use crate::config::BackendConfig;
use crate::error::{HivecountError, Result};
use crate::mesh::MeshBackend;

/// Async constructor for one backend kind.
pub type BackendFactory =
    Arc<dyn Fn(BackendConfig) -> BoxFuture<'static, Result<Arc<dyn CounterBackend>>> + Send + Sync>;

/// Fixed table of backend constructors, populated by the hosting application
/// before the orchestrator is built.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `memory` and `mesh` kinds registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |config: BackendConfig| async move {
            let backend: Arc<dyn CounterBackend> = Arc::new(MemoryBackend::from_config(&config)?);
            Ok::<_, HivecountError>(backend)
        });
        registry.register("mesh", |config: BackendConfig| async move {
            let backend: Arc<dyn CounterBackend> =
                Arc::new(MeshBackend::from_config(&config).await?);
            Ok::<_, HivecountError>(backend)
        });
        registry
    }

    /// Register a constructor for `kind`, replacing any previous one.
    pub fn register<F, Fut>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(BackendConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn CounterBackend>>> + Send + 'static,
    {
        let kind = kind.into();
        let factory: BackendFactory = Arc::new(
            move |config: BackendConfig| -> BoxFuture<'static, Result<Arc<dyn CounterBackend>>> {
                Box::pin(factory(config))
            },
        );
        if self.factories.insert(kind.clone(), factory).is_some() {
            debug!(kind = %kind, "Replaced backend factory");
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Construct the backend described by `config`.
    pub async fn build(&self, config: &BackendConfig) -> Result<Arc<dyn CounterBackend>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            HivecountError::Configuration(format!(
                "backend '{}' has unknown kind '{}' (known: {})",
                config.name,
                config.kind,
                self.kinds().join(", ")
            ))
        })?;

        debug!(backend = %config.name, kind = %config.kind, "Constructing backend");
        factory(config.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builtin_kinds() {
        let registry = BackendRegistry::builtin();
        assert!(registry.contains("memory"));
        assert!(registry.contains("mesh"));
        assert_eq!(registry.kinds(), vec!["memory", "mesh"]);
    }

    #[tokio::test]
    async fn test_build_memory_backend() {
        let registry = BackendRegistry::builtin();
        let backend = registry
            .build(&BackendConfig::new("memory1", "memory"))
            .await
            .unwrap();

        assert_eq!(backend.increment("k", Duration::from_secs(60)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let registry = BackendRegistry::builtin();
        let err = registry
            .build(&BackendConfig::new("cache", "redis"))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, HivecountError::Configuration(ref m) if m.contains("redis")));
    }

    #[tokio::test]
    async fn test_register_custom_kind() {
        let mut registry = BackendRegistry::new();
        assert!(!registry.contains("custom"));

        registry.register("custom", |_config: BackendConfig| async {
            let backend: Arc<dyn CounterBackend> = Arc::new(MemoryBackend::new());
            Ok::<_, HivecountError>(backend)
        });

        assert!(registry.contains("custom"));
        assert!(registry
            .build(&BackendConfig::new("c1", "custom"))
            .await
            .is_ok());
    }
}
