//! Model repository handlers
//!
//! Administrative operations: list what the repository holds together with
//! its live state, and load or unload models by name. These calls go straight
//! to the registry and never pass through a batcher.

use crate::cache::ResponseCache;
use crate::registry::ModelRegistry;
use crate::repository::ModelRepository;
use std::collections::HashSet;
use std::sync::Arc;
use tensorserve_common::{ModelSettings, Result};
use tensorserve_proto::{ModelAvailability, RepositoryIndexItem, RepositoryIndexRequest, RepositoryIndexResponse};
use tensorserve_worker::{ModelInstance, ModelState};
use tracing::info;

pub struct ModelRepositoryHandlers {
    repository: Arc<dyn ModelRepository>,
    registry: Arc<ModelRegistry>,
    cache: Option<Arc<ResponseCache>>,
}

impl ModelRepositoryHandlers {
    pub fn new(
        repository: Arc<dyn ModelRepository>,
        registry: Arc<ModelRegistry>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            repository,
            registry,
            cache,
        }
    }

    /// Repository contents with their state
    ///
    /// Models loaded outside the repository are listed too.
    pub async fn index(&self, request: RepositoryIndexRequest) -> Result<RepositoryIndexResponse> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for settings in self.repository.list().await? {
            let instance = self
                .registry
                .get_model(&settings.name, settings.version())
                .await
                .ok()
                .filter(|instance| instance.version() == settings.version());
            seen.insert((settings.name.clone(), settings.version().map(str::to_string)));
            items.push(index_item(&settings, instance.as_deref()));
        }

        for instance in self.registry.all().await {
            let key = (instance.name().to_string(), instance.version().map(str::to_string));
            if seen.insert(key) {
                items.push(index_item(instance.settings(), Some(instance.as_ref())));
            }
        }

        if request.ready.unwrap_or(false) {
            items.retain(|item| item.state == ModelAvailability::Ready);
        }
        Ok(items)
    }

    /// Load every version of `name` the repository knows about
    pub async fn load(&self, name: &str) -> Result<bool> {
        let all_settings = self.repository.find(name).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate(name);
        }
        for settings in all_settings {
            self.registry.load(settings).await?;
        }
        // Calls still running on a replaced instance may have cached meanwhile
        if let Some(cache) = &self.cache {
            cache.invalidate(name);
        }
        info!("Loaded model {}", name);
        Ok(true)
    }

    /// Unload every version of `name`
    pub async fn unload(&self, name: &str) -> Result<bool> {
        self.registry.unload(name).await?;
        if let Some(cache) = &self.cache {
            cache.invalidate(name);
        }
        Ok(true)
    }
}

fn index_item(settings: &ModelSettings, instance: Option<&ModelInstance>) -> RepositoryIndexItem {
    let (state, reason) = match instance {
        None => (ModelAvailability::Unavailable, String::new()),
        Some(instance) => match instance.state() {
            ModelState::Ready => (ModelAvailability::Ready, String::new()),
            ModelState::Loading => (ModelAvailability::Loading, String::new()),
            ModelState::Unloading => (ModelAvailability::Unloading, String::new()),
            ModelState::Unloaded => (ModelAvailability::Unavailable, String::new()),
            ModelState::Failed => (ModelAvailability::Failed, instance.reason()),
        },
    };

    RepositoryIndexItem {
        name: settings.name.clone(),
        version: settings.version().map(str::to_string),
        state,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::repository::InMemoryModelRepository;
    use std::time::Duration;
    use tensorserve_common::{ServeError, ServerSettings};
    use tensorserve_proto::{InferenceRequest, InferenceResponse};
    use tensorserve_worker::{EchoRuntime, ModelRuntime, RuntimeRegistry};

    /// Echo runtime whose load takes a while
    struct SlowLoad(EchoRuntime);

    impl ModelRuntime for SlowLoad {
        fn load(&mut self) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(150));
            self.0.load()
        }

        fn predict(&mut self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
            self.0.predict(request)
        }
    }

    fn handlers(models: Vec<ModelSettings>) -> ModelRepositoryHandlers {
        let registry = Arc::new(ModelRegistry::new(
            ServerSettings::default(),
            Arc::new(RuntimeRegistry::with_builtins()),
        ));
        ModelRepositoryHandlers::new(Arc::new(InMemoryModelRepository::new(models)), registry, None)
    }

    #[tokio::test]
    async fn test_index_reports_states() {
        let handlers = handlers(vec![
            ModelSettings::builder("ready", "echo").build().unwrap(),
            ModelSettings::builder("idle", "echo").build().unwrap(),
            ModelSettings::builder("broken", "missing").build().unwrap(),
        ]);
        handlers.load("ready").await.unwrap();
        assert!(handlers.load("broken").await.is_err());

        let index = handlers.index(RepositoryIndexRequest::default()).await.unwrap();
        let state = |name: &str| index.iter().find(|item| item.name == name).unwrap().clone();
        assert_eq!(state("ready").state, ModelAvailability::Ready);
        assert_eq!(state("idle").state, ModelAvailability::Unavailable);
        assert_eq!(state("broken").state, ModelAvailability::Failed);
        assert!(state("broken").reason.contains("missing"));

        let ready = handlers
            .index(RepositoryIndexRequest { ready: Some(true) })
            .await
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].name, "ready");

        handlers.unload("ready").await.unwrap();
        handlers.unload("broken").await.unwrap();
    }

    #[tokio::test]
    async fn test_load_unknown_model() {
        let handlers = handlers(vec![]);
        let err = handlers.load("ghost").await.unwrap_err();
        assert!(matches!(err, ServeError::ModelNotFound { .. }));
        assert!(handlers.unload("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_cache_is_clear_after_reload() {
        let mut runtimes = RuntimeRegistry::with_builtins();
        runtimes.register("slow-load", |settings: &ModelSettings| {
            Ok(Box::new(SlowLoad(EchoRuntime::new(settings))) as Box<dyn ModelRuntime>)
        });
        let registry = Arc::new(ModelRegistry::new(ServerSettings::default(), Arc::new(runtimes)));
        let repository = Arc::new(InMemoryModelRepository::new(vec![ModelSettings::builder(
            "cached", "slow-load",
        )
        .cache_enabled(true)
        .build()
        .unwrap()]));
        let cache = Arc::new(ResponseCache::new(4).unwrap());
        let handlers = Arc::new(ModelRepositoryHandlers::new(
            repository,
            registry,
            Some(Arc::clone(&cache)),
        ));

        let loading = {
            let handlers = Arc::clone(&handlers);
            tokio::spawn(async move { handlers.load("cached").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A response from the previous instance landing while the new one loads
        let request = InferenceRequest::default();
        let key = CacheKey::new("cached", None, &request).unwrap();
        cache.insert(key, InferenceResponse::new("cached", vec![]));
        assert_eq!(cache.len(), 1);

        assert!(loading.await.unwrap().unwrap());
        assert!(cache.is_empty());
        handlers.unload("cached").await.unwrap();
    }
}
