//! Model instance lifecycle
//!
//! A model instance ties one model version's settings to its worker pool and
//! batcher. State moves Unloaded -> Loading -> Ready -> Unloading ->
//! Unloaded, with Failed reachable from Loading. Inference is only accepted
//! while Ready.

use crate::batching::{AdaptiveBatcher, BatchStats};
use crate::pool::{PoolConfig, WorkerInfo, WorkerPool};
use crate::runtime::RuntimeRegistry;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tensorserve_common::{ModelSettings, Result, ServeError};
use tensorserve_proto::{InferenceRequest, InferenceResponse};
use tracing::{error, info};

/// Lifecycle state of a model instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready => "ready",
            ModelState::Unloading => "unloading",
            ModelState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
struct Runner {
    pool: Arc<WorkerPool>,
    batcher: Arc<AdaptiveBatcher>,
}

struct Lifecycle {
    state: ModelState,
    runner: Option<Runner>,
    reason: String,
}

/// One loaded (or loadable) version of a model
pub struct ModelInstance {
    settings: Arc<ModelSettings>,
    runtimes: Arc<RuntimeRegistry>,
    pool_config: PoolConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("name", &self.name())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

impl ModelInstance {
    pub fn new(settings: ModelSettings, runtimes: Arc<RuntimeRegistry>, pool_config: PoolConfig) -> Self {
        Self {
            settings: Arc::new(settings),
            runtimes,
            pool_config,
            lifecycle: Mutex::new(Lifecycle {
                state: ModelState::Unloaded,
                runner: None,
                reason: String::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn version(&self) -> Option<&str> {
        self.settings.version()
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    pub fn state(&self) -> ModelState {
        self.lifecycle.lock().state
    }

    /// Why the last load failed, empty otherwise
    pub fn reason(&self) -> String {
        self.lifecycle.lock().reason.clone()
    }

    /// Ready and backed by at least one live worker
    pub fn ready(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.runner) {
            (ModelState::Ready, Some(runner)) => runner.pool.live_workers() > 0,
            _ => false,
        }
    }

    /// Start the workers; a no-op while loading or ready
    pub async fn load(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                ModelState::Loading | ModelState::Ready => return Ok(()),
                ModelState::Unloading => return Err(self.not_ready()),
                ModelState::Unloaded | ModelState::Failed => {}
            }
            if let Err(e) = self.settings.validate() {
                lifecycle.state = ModelState::Failed;
                lifecycle.reason = e.to_string();
                return Err(e);
            }
            lifecycle.state = ModelState::Loading;
            lifecycle.reason.clear();
        }

        info!("Loading model {} ({})", self.name(), self.settings.implementation);
        let started =
            WorkerPool::start(Arc::clone(&self.settings), Arc::clone(&self.runtimes), self.pool_config.clone()).await;

        let mut lifecycle = self.lifecycle.lock();
        match started {
            Ok(pool) => {
                let batcher = AdaptiveBatcher::new(&self.settings, Arc::clone(&pool));
                lifecycle.runner = Some(Runner { pool, batcher });
                lifecycle.state = ModelState::Ready;
                info!("Model {} is ready", self.name());
                Ok(())
            }
            Err(e) => {
                error!("Failed to load model {}: {}", self.name(), e);
                lifecycle.state = ModelState::Failed;
                lifecycle.reason = e.to_string();
                Err(e)
            }
        }
    }

    /// Drain pending batches, then stop the workers
    pub async fn unload(&self) -> Result<()> {
        let runner = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.state {
                ModelState::Ready => {
                    lifecycle.state = ModelState::Unloading;
                    lifecycle.runner.take()
                }
                ModelState::Unloaded | ModelState::Failed => {
                    lifecycle.state = ModelState::Unloaded;
                    return Ok(());
                }
                ModelState::Loading | ModelState::Unloading => return Err(self.not_ready()),
            }
        };

        if let Some(runner) = runner {
            runner.batcher.drain().await;
            runner.pool.shutdown().await;
        }

        self.lifecycle.lock().state = ModelState::Unloaded;
        info!("Model {} unloaded", self.name());
        Ok(())
    }

    /// Run one request through the batcher
    pub async fn infer(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let batcher = {
            let lifecycle = self.lifecycle.lock();
            match (&lifecycle.state, &lifecycle.runner) {
                (ModelState::Ready, Some(runner)) => Arc::clone(&runner.batcher),
                _ => return Err(self.not_ready()),
            }
        };
        batcher.submit(request).await
    }

    /// Worker snapshot, empty unless loaded
    pub fn workers(&self) -> Vec<WorkerInfo> {
        let runner = self.lifecycle.lock().runner.clone();
        runner.map(|runner| runner.pool.workers()).unwrap_or_default()
    }

    pub fn batch_stats(&self) -> BatchStats {
        let runner = self.lifecycle.lock().runner.clone();
        runner.map(|runner| runner.batcher.stats()).unwrap_or_default()
    }

    fn not_ready(&self) -> ServeError {
        ServeError::model_not_ready(self.name(), self.version())
    }
}
