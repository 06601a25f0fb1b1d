//! Model runtime capability and registry
//!
//! A runtime is the opaque "run this model on this input" capability. Each
//! execution worker owns exactly one runtime instance. Runtimes are looked up
//! by the `implementation` key of a model's settings through an explicit
//! registry, so adding a backend means registering a factory.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tensorserve_common::{ModelSettings, Result, ServeError};
use tensorserve_proto::{InferenceRequest, InferenceResponse};

/// Per-item outcome of a batch call
pub type BatchItem = anyhow::Result<InferenceResponse>;

/// Blocking model capability, driven from a dedicated worker thread
pub trait ModelRuntime: Send {
    /// Load weights / artifacts
    fn load(&mut self) -> anyhow::Result<()>;

    /// Run the model on one request
    fn predict(&mut self, request: InferenceRequest) -> anyhow::Result<InferenceResponse>;

    /// Run the model on an ordered batch.
    ///
    /// The outer error fails the whole batch. The default runs each request
    /// through `predict`, which reports failures per item.
    fn predict_batch(&mut self, requests: Vec<InferenceRequest>) -> anyhow::Result<Vec<BatchItem>> {
        Ok(requests.into_iter().map(|request| self.predict(request)).collect())
    }

    /// Release resources
    fn unload(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Constructs a runtime for a model
pub type RuntimeFactory = Arc<dyn Fn(&ModelSettings) -> anyhow::Result<Box<dyn ModelRuntime>> + Send + Sync>;

/// Maps implementation keys to runtime factories
#[derive(Clone, Default)]
pub struct RuntimeRegistry {
    factories: HashMap<String, RuntimeFactory>,
}

impl fmt::Debug for RuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeRegistry").field("implementations", &self.implementations()).finish()
    }
}

impl RuntimeRegistry {
    /// Registry with the built-in runtimes
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        crate::runtimes::register_builtins(&mut registry);
        registry
    }

    /// Register a factory under `key`, replacing any previous one
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&ModelSettings) -> anyhow::Result<Box<dyn ModelRuntime>> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn implementations(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Build a fresh runtime for `settings`
    pub fn create(&self, settings: &ModelSettings) -> Result<Box<dyn ModelRuntime>> {
        let factory = self.factories.get(&settings.implementation).ok_or_else(|| {
            ServeError::config(format!(
                "unknown implementation '{}' for model '{}'",
                settings.implementation, settings.name
            ))
        })?;

        factory(settings).map_err(|e| {
            ServeError::inference(format!("failed to create runtime for model '{}': {:#}", settings.name, e))
        })
    }
}
