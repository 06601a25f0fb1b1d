//! In-memory catalog
//!
//! Serves a fixed set of descriptors handed in by the embedder. Useful when
//! models come from a remote catalog rather than a folder tree.

use super::ModelRepository;
use async_trait::async_trait;
use parking_lot::RwLock;
use tensorserve_common::{ModelSettings, Result};

#[derive(Debug, Default)]
pub struct InMemoryModelRepository {
    models: RwLock<Vec<ModelSettings>>,
}

impl InMemoryModelRepository {
    pub fn new(models: Vec<ModelSettings>) -> Self {
        Self {
            models: RwLock::new(models),
        }
    }

    /// Add or replace the descriptor with the same name and version
    pub fn upsert(&self, settings: ModelSettings) {
        let mut models = self.models.write();
        models.retain(|m| !(m.name == settings.name && m.version() == settings.version()));
        models.push(settings);
    }

    /// Drop every descriptor with this name
    pub fn remove(&self, name: &str) -> usize {
        let mut models = self.models.write();
        let before = models.len();
        models.retain(|m| m.name != name);
        before - models.len()
    }
}

#[async_trait]
impl ModelRepository for InMemoryModelRepository {
    async fn list(&self) -> Result<Vec<ModelSettings>> {
        Ok(self.models.read().clone())
    }
}
