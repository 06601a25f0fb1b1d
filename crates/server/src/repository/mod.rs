//! Model repository abstraction
//!
//! A repository answers two questions: which models exist, and which
//! descriptors carry a given name. Strategies are picked by key from the
//! server settings, so the filesystem walker can be swapped for a catalog.

mod memory;
mod schemaless;

pub use memory::InMemoryModelRepository;
pub use schemaless::{load_model_settings, SchemalessModelRepository, DEFAULT_MODEL_SETTINGS_FILENAME};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tensorserve_common::config::DEFAULT_REPOSITORY_IMPLEMENTATION;
use tensorserve_common::{ModelSettings, Result, ServeError, ServerSettings};

/// Model discovery
/// Implementations must be thread-safe and async-compatible
#[async_trait]
pub trait ModelRepository: Send + Sync + 'static {
    /// Every model descriptor the repository knows about
    async fn list(&self) -> Result<Vec<ModelSettings>>;

    /// Descriptors whose name matches, one per version
    ///
    /// Fails with `ModelNotFound` when nothing matches.
    async fn find(&self, name: &str) -> Result<Vec<ModelSettings>> {
        let selected: Vec<ModelSettings> = self
            .list()
            .await?
            .into_iter()
            .filter(|settings| settings.name == name)
            .collect();

        if selected.is_empty() {
            return Err(ServeError::model_not_found(name, None));
        }
        Ok(selected)
    }
}

/// Builds a repository from server settings
pub type RepositoryConstructor = Arc<dyn Fn(&ServerSettings) -> Result<Arc<dyn ModelRepository>> + Send + Sync>;

/// Repository strategies keyed by name
#[derive(Clone)]
pub struct RepositoryRegistry {
    strategies: HashMap<String, RepositoryConstructor>,
}

impl fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.strategies.keys().collect();
        keys.sort();
        f.debug_struct("RepositoryRegistry").field("strategies", &keys).finish()
    }
}

impl Default for RepositoryRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(DEFAULT_REPOSITORY_IMPLEMENTATION, |settings| {
            Ok(Arc::new(SchemalessModelRepository::new(&settings.model_repository_root)))
        });
        registry
    }
}

impl RepositoryRegistry {
    /// Register a strategy, replacing any previous one with the same key
    pub fn register<F>(&mut self, key: impl Into<String>, constructor: F)
    where
        F: Fn(&ServerSettings) -> Result<Arc<dyn ModelRepository>> + Send + Sync + 'static,
    {
        self.strategies.insert(key.into(), Arc::new(constructor));
    }

    pub fn get(&self, key: &str) -> Option<RepositoryConstructor> {
        self.strategies.get(key).cloned()
    }
}

/// Picks the repository strategy named in the settings
pub struct ModelRepositoryFactory;

impl ModelRepositoryFactory {
    pub fn resolve(settings: &ServerSettings, registry: &RepositoryRegistry) -> Result<Arc<dyn ModelRepository>> {
        let key = settings.model_repository_implementation.as_str();
        let constructor = registry
            .get(key)
            .ok_or_else(|| ServeError::config(format!("unknown model repository implementation '{}'", key)))?;
        constructor(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_factory_defaults_to_schemaless() {
        let dir = tempfile::tempdir().unwrap();
        let settings = ServerSettings {
            model_repository_root: dir.path().to_path_buf(),
            ..ServerSettings::default()
        };

        let repository = ModelRepositoryFactory::resolve(&settings, &RepositoryRegistry::default()).unwrap();
        assert!(repository.list().await.is_ok());
    }

    #[test]
    fn test_factory_rejects_unknown_strategy() {
        let settings = ServerSettings {
            model_repository_implementation: "s3".to_string(),
            ..ServerSettings::default()
        };

        let err = ModelRepositoryFactory::resolve(&settings, &RepositoryRegistry::default())
            .err()
            .unwrap();
        assert!(matches!(err, ServeError::Config(_)));
    }

    #[tokio::test]
    async fn test_registered_strategy_is_used() {
        let mut registry = RepositoryRegistry::default();
        registry.register("catalog", |_| {
            let settings = ModelSettings::builder("from-catalog", "echo").build()?;
            Ok(Arc::new(InMemoryModelRepository::new(vec![settings])))
        });
        let settings = ServerSettings {
            model_repository_implementation: "catalog".to_string(),
            ..ServerSettings::default()
        };

        let repository = ModelRepositoryFactory::resolve(&settings, &registry).unwrap();
        let found = repository.find("from-catalog").await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
