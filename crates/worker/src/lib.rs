//! TensorServe execution layer
//!
//! Runs model runtimes on dedicated worker threads, groups requests into
//! adaptive batches, and manages the per-model instance lifecycle.

pub mod batching;
pub mod instance;
pub mod pool;
pub mod runtime;
pub mod runtimes;
pub mod worker;

#[cfg(test)]
mod testing;

pub use batching::{AdaptiveBatcher, BatchStats, CloseTrigger};
pub use instance::{ModelInstance, ModelState};
pub use pool::{PoolConfig, WorkerInfo, WorkerPool, WorkerStatus};
pub use runtime::{BatchItem, ModelRuntime, RuntimeFactory, RuntimeRegistry};
pub use runtimes::{EchoRuntime, SumRuntime};
pub use worker::{ExecutionWorker, WorkerFault, WorkerId};
