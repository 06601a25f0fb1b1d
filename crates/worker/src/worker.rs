//! Execution worker
//!
//! Each worker owns one runtime instance on a dedicated OS thread. Commands
//! arrive over a crossbeam channel and results go back through oneshot
//! channels, so the async side never blocks on model code. A panic inside the
//! runtime is caught, reported as a crash, and ends the thread.

use crate::runtime::ModelRuntime;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::Duration;
use tensorserve_common::{Result, ServeError};
use tensorserve_proto::{InferenceRequest, InferenceResponse};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Worker identifier, unique within a pool
pub type WorkerId = u64;

/// Why a worker call did not produce results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFault {
    /// The runtime returned an error for the whole batch; the worker is healthy
    Backend(String),
    /// The worker thread died; the worker must be replaced
    Crashed(String),
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerFault::Backend(msg) => write!(f, "{}", msg),
            WorkerFault::Crashed(msg) => write!(f, "worker crashed: {}", msg),
        }
    }
}

/// Ordered per-request results of one worker call
pub type WorkerReply = std::result::Result<Vec<Result<InferenceResponse>>, WorkerFault>;

enum Command {
    Infer {
        requests: Vec<InferenceRequest>,
        reply: oneshot::Sender<WorkerReply>,
    },
    Unload {
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Handle to a running execution worker
pub struct ExecutionWorker {
    id: WorkerId,
    model: String,
    commands: Sender<Command>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ExecutionWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionWorker")
            .field("id", &self.id)
            .field("model", &self.model)
            .finish()
    }
}

impl ExecutionWorker {
    /// Spawn the worker thread and load the runtime on it
    ///
    /// Resolves once loading has finished.
    pub async fn start(id: WorkerId, model: &str, runtime: Box<dyn ModelRuntime>) -> Result<Self> {
        let (commands, inbox) = channel::unbounded();
        let (loaded_tx, loaded_rx) = oneshot::channel();

        let thread_model = model.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("{}-worker-{}", model, id))
            .spawn(move || run(id, thread_model, runtime, inbox, loaded_tx))?;

        match loaded_rx.await {
            Ok(Ok(())) => {
                debug!("Worker {} for model {} loaded", id, model);
                Ok(Self {
                    id,
                    model: model.to_string(),
                    commands,
                    thread: Mutex::new(Some(thread)),
                })
            }
            Ok(Err(fault)) => Err(ServeError::inference(format!(
                "worker {} failed to load model '{}': {}",
                id, model, fault
            ))),
            Err(_) => Err(ServeError::inference(format!(
                "worker {} for model '{}' exited during load",
                id, model
            ))),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the worker thread is still running
    pub fn is_alive(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Run an ordered batch on this worker
    pub async fn infer(&self, requests: Vec<InferenceRequest>) -> WorkerReply {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Infer { requests, reply })
            .map_err(|_| WorkerFault::Crashed("worker thread is gone".to_string()))?;

        response
            .await
            .map_err(|_| WorkerFault::Crashed("worker exited without replying".to_string()))?
    }

    /// Unload the runtime and stop the thread
    ///
    /// If the worker does not finish within `grace` it is force-stopped: the
    /// thread is detached and left to exit on its own.
    pub async fn stop(&self, grace: Duration) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Unload { reply }).is_err() {
            self.thread.lock().take();
            return;
        }

        match tokio::time::timeout(grace, done).await {
            Ok(Ok(Ok(()))) => debug!("Worker {} for model {} unloaded", self.id, self.model),
            Ok(Ok(Err(e))) => warn!("Worker {} for model {} failed to unload: {:#}", self.id, self.model, e),
            Ok(Err(_)) => warn!("Worker {} for model {} exited during unload", self.id, self.model),
            Err(_) => {
                warn!(
                    "Worker {} for model {} did not stop within {:?}, force-stopping",
                    self.id, self.model, grace
                );
                self.thread.lock().take();
                return;
            }
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                _ => error!("Worker {} for model {} panicked while stopping", self.id, self.model),
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run(
    id: WorkerId,
    model: String,
    mut runtime: Box<dyn ModelRuntime>,
    inbox: Receiver<Command>,
    loaded: oneshot::Sender<std::result::Result<(), WorkerFault>>,
) {
    let load = match panic::catch_unwind(AssertUnwindSafe(|| runtime.load())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WorkerFault::Backend(format!("{:#}", e))),
        Err(payload) => Err(WorkerFault::Crashed(panic_message(payload))),
    };
    let failed = load.is_err();
    let _ = loaded.send(load);
    if failed {
        return;
    }

    while let Ok(command) = inbox.recv() {
        match command {
            Command::Infer { requests, reply } => {
                let expected = requests.len();
                match panic::catch_unwind(AssertUnwindSafe(|| runtime.predict_batch(requests))) {
                    Ok(Ok(items)) => {
                        let items = items
                            .into_iter()
                            .map(|item| item.map_err(|e| ServeError::inference(format!("{:#}", e))))
                            .collect();
                        let _ = reply.send(Ok(items));
                    }
                    Ok(Err(e)) => {
                        debug!("Worker {} failed a batch of {}: {:#}", id, expected, e);
                        let _ = reply.send(Err(WorkerFault::Backend(format!("{:#}", e))));
                    }
                    Err(payload) => {
                        let msg = panic_message(payload);
                        error!("Worker {} for model {} crashed: {}", id, model, msg);
                        let _ = reply.send(Err(WorkerFault::Crashed(msg)));
                        return;
                    }
                }
            }
            Command::Unload { reply } => {
                let result = match panic::catch_unwind(AssertUnwindSafe(|| runtime.unload())) {
                    Ok(result) => result,
                    Err(payload) => Err(anyhow::anyhow!("panic during unload: {}", panic_message(payload))),
                };
                let _ = reply.send(result);
                info!("Worker {} for model {} stopped", id, model);
                return;
            }
        }
    }

    debug!("Worker {} for model {} lost its pool, exiting", id, model);
}
