//! Server assembly
//!
//! Wires settings, repository, registry, data plane and handlers together and
//! owns the startup and shutdown sequence.

use crate::cache::ResponseCache;
use crate::dataplane::DataPlane;
use crate::handlers::ModelRepositoryHandlers;
use crate::registry::ModelRegistry;
use crate::repository::{ModelRepository, ModelRepositoryFactory, RepositoryRegistry};
use std::sync::Arc;
use tensorserve_common::{Result, ServerSettings, METRICS};
use tensorserve_proto::CodecRegistry;
use tensorserve_worker::RuntimeRegistry;
use tracing::{error, info};

pub struct TensorServer {
    settings: ServerSettings,
    repository: Arc<dyn ModelRepository>,
    registry: Arc<ModelRegistry>,
    dataplane: Arc<DataPlane>,
    handlers: Arc<ModelRepositoryHandlers>,
}

impl TensorServer {
    /// Server with the built-in runtimes and repository strategies
    pub fn new(settings: ServerSettings) -> Result<Self> {
        Self::with_registries(settings, RuntimeRegistry::with_builtins(), &RepositoryRegistry::default())
    }

    pub fn with_registries(
        settings: ServerSettings,
        runtimes: RuntimeRegistry,
        repositories: &RepositoryRegistry,
    ) -> Result<Self> {
        settings.validate()?;
        METRICS.set_enabled(settings.metrics_enabled);

        let repository = ModelRepositoryFactory::resolve(&settings, repositories)?;
        let registry = Arc::new(ModelRegistry::new(settings.clone(), Arc::new(runtimes)));
        let cache = if settings.cache_enabled {
            Some(Arc::new(ResponseCache::new(settings.cache_size)?))
        } else {
            None
        };

        let dataplane = Arc::new(DataPlane::new(
            settings.clone(),
            Arc::clone(&registry),
            Arc::new(CodecRegistry::default()),
            cache.clone(),
        ));
        let handlers = Arc::new(ModelRepositoryHandlers::new(
            Arc::clone(&repository),
            Arc::clone(&registry),
            cache,
        ));

        Ok(Self {
            settings,
            repository,
            registry,
            dataplane,
            handlers,
        })
    }

    /// Load startup models if configured to
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting {} {} with repository at {}",
            self.settings.server_name,
            self.settings.server_version,
            self.settings.model_repository_root.display()
        );
        if self.settings.load_models_at_startup {
            let loaded = self.load_models().await?;
            info!("Loaded {} models at startup", loaded);
        }
        Ok(())
    }

    /// Load everything the repository lists
    ///
    /// Fails only when the repository itself cannot be read. A model that
    /// fails to load is logged and left in the registry as Failed.
    pub async fn load_models(&self) -> Result<usize> {
        let mut loaded = 0;
        for settings in self.repository.list().await? {
            let name = settings.name.clone();
            match self.registry.load(settings).await {
                Ok(_) => loaded += 1,
                Err(e) => error!("Failed to load model {}: {}", name, e),
            }
        }
        Ok(loaded)
    }

    /// Unload every model, draining batches within each pool's grace period
    pub async fn stop(&self) {
        info!("Stopping {}", self.settings.server_name);
        self.registry.unload_all().await;
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn dataplane(&self) -> Arc<DataPlane> {
        Arc::clone(&self.dataplane)
    }

    pub fn handlers(&self) -> Arc<ModelRepositoryHandlers> {
        Arc::clone(&self.handlers)
    }

    pub fn registry(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.registry)
    }
}
