//! Model registry
//!
//! Tracks live model instances by name and version. The most recently loaded
//! version of a name is its default. Loads and unloads of one name are
//! serialised; different names proceed independently.

use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tensorserve_common::{ModelSettings, Result, ServeError, ServerSettings};
use tensorserve_worker::{ModelInstance, ModelState, PoolConfig, RuntimeRegistry};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Versions of one model name
struct ModelVersions {
    name: String,
    /// Ordered by load time; the last entry is the default
    instances: SyncRwLock<Vec<Arc<ModelInstance>>>,
    /// Serialises lifecycle operations on this name
    lifecycle: Mutex<()>,
}

impl ModelVersions {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            instances: SyncRwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// `None` picks the newest Ready instance, or the newest one if none is Ready
    fn find(&self, version: Option<&str>) -> Option<Arc<ModelInstance>> {
        let instances = self.instances.read();
        match version {
            Some(version) => instances.iter().rev().find(|m| m.version() == Some(version)).cloned(),
            None => instances
                .iter()
                .rev()
                .find(|m| m.state() == ModelState::Ready)
                .or_else(|| instances.last())
                .cloned(),
        }
    }

    fn find_exact(&self, version: Option<&str>) -> Option<Arc<ModelInstance>> {
        self.instances.read().iter().find(|m| m.version() == version).cloned()
    }

    /// Store `instance` as the newest version, replacing one with the same version
    fn promote(&self, instance: Arc<ModelInstance>) {
        let mut instances = self.instances.write();
        instances.retain(|m| m.version() != instance.version());
        instances.push(instance);
    }

    fn remove(&self, version: Option<&str>) -> Option<Arc<ModelInstance>> {
        let mut instances = self.instances.write();
        let position = instances.iter().position(|m| m.version() == version)?;
        Some(instances.remove(position))
    }

    fn all(&self) -> Vec<Arc<ModelInstance>> {
        self.instances.read().clone()
    }

    fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

/// Live model instances of the server
pub struct ModelRegistry {
    settings: ServerSettings,
    runtimes: Arc<RuntimeRegistry>,
    models: RwLock<HashMap<String, Arc<ModelVersions>>>,
}

impl ModelRegistry {
    pub fn new(settings: ServerSettings, runtimes: Arc<RuntimeRegistry>) -> Self {
        Self {
            settings,
            runtimes,
            models: RwLock::new(HashMap::new()),
        }
    }

    async fn versions(&self, name: &str) -> Option<Arc<ModelVersions>> {
        self.models.read().await.get(name).cloned()
    }

    async fn versions_or_insert(&self, name: &str) -> Arc<ModelVersions> {
        let mut models = self.models.write().await;
        Arc::clone(
            models
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ModelVersions::new(name))),
        )
    }

    fn instance(&self, settings: ModelSettings) -> Arc<ModelInstance> {
        let pool_config = PoolConfig::from_settings(&self.settings, &settings);
        Arc::new(ModelInstance::new(settings, Arc::clone(&self.runtimes), pool_config))
    }

    /// Load a model version
    ///
    /// Loading settings identical to a live version is a no-op. Changed
    /// settings start a replacement, swap it in once ready, then unload the
    /// previous instance. A failed first load stays registered as Failed.
    pub async fn load(&self, settings: ModelSettings) -> Result<Arc<ModelInstance>> {
        settings.validate()?;
        let versions = self.versions_or_insert(&settings.name).await;
        let _lifecycle = versions.lifecycle.lock().await;
        // An unload may have pruned the entry while we waited
        self.models
            .write()
            .await
            .entry(settings.name.clone())
            .or_insert_with(|| Arc::clone(&versions));

        let current = versions.find_exact(settings.version());
        match current {
            Some(current) if current.settings() == &settings => {
                if current.state() != ModelState::Ready {
                    current.load().await?;
                }
                debug!("Model {} is already loaded", settings.name);
                versions.promote(Arc::clone(&current));
                Ok(current)
            }
            Some(current) => {
                info!("Reloading model {} with new settings", settings.name);
                let replacement = self.instance(settings);
                replacement.load().await?;
                versions.promote(Arc::clone(&replacement));
                if let Err(e) = current.unload().await {
                    warn!("Failed to unload previous instance of model {}: {}", versions.name, e);
                }
                Ok(replacement)
            }
            None => {
                let instance = self.instance(settings);
                versions.promote(Arc::clone(&instance));
                instance.load().await?;
                Ok(instance)
            }
        }
    }

    /// Unload every version of a model
    pub async fn unload(&self, name: &str) -> Result<()> {
        let versions = self
            .versions(name)
            .await
            .ok_or_else(|| ServeError::model_not_found(name, None))?;
        let _lifecycle = versions.lifecycle.lock().await;

        for instance in versions.all() {
            instance.unload().await?;
            versions.remove(instance.version());
        }
        self.prune(name, &versions).await;
        info!("Unloaded all versions of model {}", name);
        Ok(())
    }

    /// Unload one version of a model
    pub async fn unload_version(&self, name: &str, version: Option<&str>) -> Result<()> {
        let versions = self
            .versions(name)
            .await
            .ok_or_else(|| ServeError::model_not_found(name, version))?;
        let _lifecycle = versions.lifecycle.lock().await;

        let instance = versions
            .find_exact(version)
            .ok_or_else(|| ServeError::model_not_found(name, version))?;
        instance.unload().await?;
        versions.remove(version);
        self.prune(name, &versions).await;
        Ok(())
    }

    async fn prune(&self, name: &str, versions: &Arc<ModelVersions>) {
        let mut models = self.models.write().await;
        let unchanged = models.get(name).map_or(false, |current| Arc::ptr_eq(current, versions));
        if unchanged && versions.is_empty() {
            models.remove(name);
        }
    }

    /// A model instance; `None` selects the default version
    pub async fn get_model(&self, name: &str, version: Option<&str>) -> Result<Arc<ModelInstance>> {
        self.versions(name)
            .await
            .and_then(|versions| versions.find(version))
            .ok_or_else(|| ServeError::model_not_found(name, version))
    }

    /// Every version of a model, oldest first
    pub async fn get_models(&self, name: &str) -> Result<Vec<Arc<ModelInstance>>> {
        match self.versions(name).await.map(|versions| versions.all()) {
            Some(instances) if !instances.is_empty() => Ok(instances),
            _ => Err(ServeError::model_not_found(name, None)),
        }
    }

    /// Every instance of every model
    pub async fn all(&self) -> Vec<Arc<ModelInstance>> {
        let models: Vec<Arc<ModelVersions>> = self.models.read().await.values().cloned().collect();
        models.iter().flat_map(|versions| versions.all()).collect()
    }

    /// Unload everything, used at shutdown
    pub async fn unload_all(&self) {
        let names: Vec<String> = self.models.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.unload(&name).await {
                warn!("Failed to unload model {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(ServerSettings::default(), Arc::new(RuntimeRegistry::with_builtins()))
    }

    fn echo(version: &str) -> ModelSettings {
        ModelSettings::builder("iris", "echo").version(version).build().unwrap()
    }

    #[tokio::test]
    async fn test_default_version_is_latest_loaded() {
        let registry = registry();
        registry.load(echo("v1")).await.unwrap();
        registry.load(echo("v2")).await.unwrap();

        let default = registry.get_model("iris", None).await.unwrap();
        assert_eq!(default.version(), Some("v2"));
        let v1 = registry.get_model("iris", Some("v1")).await.unwrap();
        assert_eq!(v1.version(), Some("v1"));
        assert_eq!(registry.get_models("iris").await.unwrap().len(), 2);

        registry.unload_all().await;
        assert!(registry.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_identical_load_is_idempotent() {
        let registry = registry();
        let first = registry.load(echo("v1")).await.unwrap();
        let second = registry.load(echo("v1")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.all().await.len(), 1);
        registry.unload("iris").await.unwrap();
    }

    #[tokio::test]
    async fn test_changed_settings_swap_instance() {
        let registry = registry();
        let first = registry.load(echo("v1")).await.unwrap();
        let changed = ModelSettings::builder("iris", "sum").version("v1").build().unwrap();
        let second = registry.load(changed).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), ModelState::Unloaded);
        assert_eq!(second.state(), ModelState::Ready);
        assert_eq!(registry.all().await.len(), 1);
        registry.unload("iris").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_instance() {
        let registry = registry();
        let first = registry.load(echo("v1")).await.unwrap();
        let broken = ModelSettings::builder("iris", "missing").version("v1").build().unwrap();

        assert!(registry.load(broken).await.is_err());
        let current = registry.get_model("iris", Some("v1")).await.unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert!(current.ready());
        registry.unload("iris").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_new_version_does_not_become_default() {
        let registry = registry();
        let v1 = registry.load(echo("v1")).await.unwrap();
        let broken = ModelSettings::builder("iris", "missing").version("v2").build().unwrap();
        assert!(registry.load(broken).await.is_err());

        let default = registry.get_model("iris", None).await.unwrap();
        assert!(Arc::ptr_eq(&v1, &default));
        let v2 = registry.get_model("iris", Some("v2")).await.unwrap();
        assert_eq!(v2.state(), ModelState::Failed);
        assert_eq!(registry.get_models("iris").await.unwrap().len(), 2);

        registry.unload("iris").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_only_version_is_still_resolved() {
        let registry = registry();
        let broken = ModelSettings::builder("iris", "missing").version("v1").build().unwrap();
        assert!(registry.load(broken).await.is_err());

        let default = registry.get_model("iris", None).await.unwrap();
        assert_eq!(default.state(), ModelState::Failed);
        assert!(!default.ready());
        registry.unload("iris").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let registry = registry();
        assert!(matches!(
            registry.get_model("ghost", None).await,
            Err(ServeError::ModelNotFound { .. })
        ));
        assert!(matches!(
            registry.unload("ghost").await,
            Err(ServeError::ModelNotFound { .. })
        ));
    }
}
