//! Worker pool
//!
//! A fixed set of execution workers per model. Dispatch hands a batch to the
//! least recently used idle worker, waiting up to a bounded budget when all
//! workers are busy. Crashed workers are retired and replaced in the
//! background so the pool keeps serving.

use crate::runtime::RuntimeRegistry;
use crate::worker::{ExecutionWorker, WorkerFault, WorkerId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tensorserve_common::{ModelSettings, Result, ServeError, ServerSettings, METRICS};
use tensorserve_proto::{InferenceRequest, InferenceResponse};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers to keep running
    pub workers: usize,

    /// How long a dispatch may wait for an idle worker
    pub wait_budget: Duration,

    /// How long shutdown waits for in-flight calls and unloads
    pub grace: Duration,
}

impl PoolConfig {
    pub fn from_settings(server: &ServerSettings, model: &ModelSettings) -> Self {
        Self {
            workers: model.workers(server.parallel_workers),
            wait_budget: server.worker_wait_timeout(),
            grace: server.shutdown_grace(),
        }
    }
}

/// Lifecycle of a worker as seen by its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Draining,
    Stopped,
}

/// Snapshot of one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub calls: u64,
}

struct WorkerSlot {
    worker: Option<Arc<ExecutionWorker>>,
    status: WorkerStatus,
    calls: u64,
}

#[derive(Default)]
struct PoolState {
    slots: BTreeMap<WorkerId, WorkerSlot>,
    idle: VecDeque<WorkerId>,
    in_flight: usize,
    draining: bool,
    next_id: WorkerId,
}

impl PoolState {
    /// Reserve a slot for a worker that is about to start
    fn reserve(&mut self) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            WorkerSlot {
                worker: None,
                status: WorkerStatus::Starting,
                calls: 0,
            },
        );
        id
    }
}

/// Execution workers of one model
pub struct WorkerPool {
    model: String,
    settings: Arc<ModelSettings>,
    runtimes: Arc<RuntimeRegistry>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled whenever a worker becomes idle
    idle: Notify,
    /// Signalled when the last in-flight call finishes during shutdown
    drained: Notify,
}

impl WorkerPool {
    /// Start every worker of the pool
    ///
    /// Fails if any worker fails to load; workers that did start are stopped.
    pub async fn start(
        settings: Arc<ModelSettings>,
        runtimes: Arc<RuntimeRegistry>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            model: settings.name.clone(),
            settings,
            runtimes,
            config,
            state: Mutex::new(PoolState::default()),
            idle: Notify::new(),
            drained: Notify::new(),
        });

        let ids: Vec<WorkerId> = {
            let mut state = pool.state.lock();
            (0..pool.config.workers).map(|_| state.reserve()).collect()
        };

        let mut launches = JoinSet::new();
        for id in ids {
            let pool = Arc::clone(&pool);
            launches.spawn(async move { (id, pool.launch(id).await) });
        }

        let mut failure = None;
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok((id, Ok(worker))) => {
                    if let Err(worker) = pool.admit(id, worker) {
                        worker.stop(pool.config.grace).await;
                    }
                }
                Ok((id, Err(e))) => {
                    pool.forget(id);
                    failure = failure.or(Some(e));
                }
                Err(e) => {
                    let e = ServeError::internal(format!("worker launch task failed: {}", e));
                    failure = failure.or(Some(e));
                }
            }
        }

        if let Some(e) = failure {
            error!("Failed to start workers for model {}: {}", pool.model, e);
            pool.shutdown().await;
            return Err(e);
        }

        info!("Started {} workers for model {}", pool.config.workers, pool.model);
        Ok(pool)
    }

    async fn launch(&self, id: WorkerId) -> Result<Arc<ExecutionWorker>> {
        let runtime = self.runtimes.create(&self.settings)?;
        let worker = ExecutionWorker::start(id, &self.model, runtime).await?;
        Ok(Arc::new(worker))
    }

    /// Move a started worker into the idle queue; hands it back when draining
    fn admit(&self, id: WorkerId, worker: Arc<ExecutionWorker>) -> std::result::Result<(), Arc<ExecutionWorker>> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.draining {
                state.slots.remove(&id);
                return Err(worker);
            }
            let slot = match state.slots.get_mut(&id) {
                Some(slot) => slot,
                None => return Err(worker),
            };
            slot.worker = Some(worker);
            slot.status = WorkerStatus::Idle;
            state.idle.push_back(id);
        }

        METRICS.record(|m| m.pool.live_workers.inc());
        self.idle.notify_one();
        Ok(())
    }

    fn forget(&self, id: WorkerId) {
        self.state.lock().slots.remove(&id);
    }

    /// Run an ordered batch on the least recently used idle worker
    ///
    /// Returns one result per request, in request order. The worker call runs
    /// in its own task, so cancelling the caller never strands a worker.
    pub async fn dispatch(self: &Arc<Self>, requests: Vec<InferenceRequest>) -> Result<Vec<Result<InferenceResponse>>> {
        let waited = Instant::now();
        let worker = match tokio::time::timeout(self.config.wait_budget, self.acquire()).await {
            Ok(acquired) => acquired?,
            Err(_) => {
                METRICS.record(|m| m.pool.workers_unavailable.inc());
                warn!(
                    "No idle worker for model {} within {:?}",
                    self.model, self.config.wait_budget
                );
                return Err(ServeError::worker_unavailable(format!(
                    "no idle worker for model '{}' within {:?}",
                    self.model, self.config.wait_budget
                )));
            }
        };
        METRICS.record(|m| m.pool.worker_wait.observe(waited.elapsed().as_secs_f64()));

        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.run_on(worker, requests).await })
            .await
            .map_err(|e| ServeError::internal(format!("worker call for model '{}' aborted: {}", self.model, e)))?
    }

    async fn acquire(&self) -> Result<Arc<ExecutionWorker>> {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.draining {
                    return Err(ServeError::worker_unavailable(format!(
                        "model '{}' is shutting down",
                        self.model
                    )));
                }

                while let Some(id) = state.idle.pop_front() {
                    let Some(slot) = state.slots.get_mut(&id) else {
                        continue;
                    };
                    let worker = match (slot.status, &slot.worker) {
                        (WorkerStatus::Idle, Some(worker)) => Arc::clone(worker),
                        _ => continue,
                    };
                    slot.status = WorkerStatus::Busy;
                    slot.calls += 1;
                    state.in_flight += 1;
                    return Ok(worker);
                }
            }

            notified.await;
        }
    }

    async fn run_on(
        self: Arc<Self>,
        worker: Arc<ExecutionWorker>,
        requests: Vec<InferenceRequest>,
    ) -> Result<Vec<Result<InferenceResponse>>> {
        let expected = requests.len();
        let started = Instant::now();
        let reply = worker.infer(requests).await;
        METRICS.record(|m| m.pool.worker_duration.observe(started.elapsed().as_secs_f64()));

        match reply {
            Ok(items) => {
                self.release(worker.id());
                if items.len() != expected {
                    return Err(ServeError::inference(format!(
                        "model '{}' returned {} responses for {} requests",
                        self.model,
                        items.len(),
                        expected
                    )));
                }
                Ok(items)
            }
            Err(WorkerFault::Backend(msg)) => {
                self.release(worker.id());
                Err(ServeError::inference(msg))
            }
            Err(WorkerFault::Crashed(msg)) => {
                self.retire(worker.id());
                Err(ServeError::inference(format!(
                    "worker {} for model '{}' crashed: {}",
                    worker.id(),
                    self.model,
                    msg
                )))
            }
        }
    }

    /// Return a worker to the back of the idle queue
    fn release(&self, id: WorkerId) {
        let drained = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(slot) = state.slots.get_mut(&id) {
                if state.draining {
                    slot.status = WorkerStatus::Draining;
                } else {
                    slot.status = WorkerStatus::Idle;
                    state.idle.push_back(id);
                }
            }
            state.draining && state.in_flight == 0
        };

        self.idle.notify_one();
        if drained {
            self.drained.notify_waiters();
        }
    }

    /// Drop a crashed worker and start a replacement unless draining
    fn retire(self: &Arc<Self>, id: WorkerId) {
        let (replacement, drained) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(mut slot) = state.slots.remove(&id) {
                slot.status = WorkerStatus::Stopped;
                if slot.worker.take().is_some() {
                    METRICS.record(|m| m.pool.live_workers.dec());
                }
            }
            let replacement = (!state.draining).then(|| state.reserve());
            (replacement, state.draining && state.in_flight == 0)
        };

        if drained {
            self.drained.notify_waiters();
        }

        let Some(new_id) = replacement else {
            return;
        };

        warn!("Replacing crashed worker {} of model {} with worker {}", id, self.model, new_id);
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.launch(new_id).await {
                Ok(worker) => match pool.admit(new_id, worker) {
                    Ok(()) => {
                        METRICS.record(|m| m.pool.worker_replacements.inc());
                        info!("Worker {} of model {} is ready", new_id, pool.model);
                    }
                    Err(worker) => worker.stop(pool.config.grace).await,
                },
                Err(e) => {
                    error!("Failed to replace worker of model {}: {}", pool.model, e);
                    pool.forget(new_id);
                }
            }
        });
    }

    /// Stop accepting work, wait for in-flight calls, then stop every worker
    ///
    /// Workers still busy when the grace period runs out are force-stopped.
    pub async fn shutdown(&self) {
        let deadline = tokio::time::Instant::now() + self.config.grace;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.draining = true;
            state.idle.clear();
            for slot in state.slots.values_mut() {
                if slot.status != WorkerStatus::Stopped {
                    slot.status = WorkerStatus::Draining;
                }
            }
        }
        self.idle.notify_waiters();

        let drained = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let in_flight = self.state.lock().in_flight;
                if in_flight == 0 {
                    break;
                }
                debug!("Waiting for {} in-flight calls of model {}", in_flight, self.model);
                notified.await;
            }
        };
        if tokio::time::timeout_at(deadline, drained).await.is_err() {
            warn!(
                "Model {} still has in-flight calls after {:?}, force-stopping workers",
                self.model, self.config.grace
            );
        }

        let workers: Vec<Arc<ExecutionWorker>> = {
            let mut state = self.state.lock();
            let workers = state
                .slots
                .values_mut()
                .filter_map(|slot| {
                    slot.status = WorkerStatus::Stopped;
                    slot.worker.take()
                })
                .collect();
            state.slots.clear();
            workers
        };
        METRICS.record(|m| m.pool.live_workers.sub(workers.len() as i64));

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let mut stops = JoinSet::new();
        for worker in workers {
            stops.spawn(async move { worker.stop(remaining).await });
        }
        while stops.join_next().await.is_some() {}

        info!("Worker pool for model {} stopped", self.model);
    }

    /// Snapshot of every worker
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|(id, slot)| WorkerInfo {
                id: *id,
                status: slot.status,
                calls: slot.calls,
            })
            .collect()
    }

    /// Workers that are not stopped
    pub fn live_workers(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.status != WorkerStatus::Stopped)
            .count()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool_config, request, scripted_registry, settings};

    async fn pool(workers: usize, wait_budget: Duration) -> Arc<WorkerPool> {
        let (runtimes, _) = scripted_registry();
        let config = PoolConfig {
            wait_budget,
            ..pool_config(workers)
        };
        WorkerPool::start(settings(1, Duration::ZERO), runtimes, config).await.unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_preserves_order() {
        let pool = pool(1, Duration::from_secs(1)).await;

        let items = pool
            .dispatch(vec![request("a"), request("b"), request("c")])
            .await
            .unwrap();
        let ids: Vec<_> = items.into_iter().map(|item| item.unwrap().id.unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_least_recently_used_worker_is_picked() {
        let pool = pool(2, Duration::from_secs(1)).await;

        pool.dispatch(vec![request("a")]).await.unwrap();
        pool.dispatch(vec![request("b")]).await.unwrap();

        let calls: Vec<u64> = pool.workers().iter().map(|w| w.calls).collect();
        assert_eq!(calls, vec![1, 1]);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_budget_exhausted() {
        let pool = pool(1, Duration::from_millis(20)).await;

        let busy = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.dispatch(vec![request("slow")]).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = pool.dispatch(vec![request("a")]).await.unwrap_err();
        assert!(matches!(err, ServeError::WorkerUnavailable(_)));

        assert!(busy.await.unwrap().is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_crashed_worker_is_replaced() {
        let pool = pool(1, Duration::from_secs(2)).await;

        let err = pool.dispatch(vec![request("panic")]).await.unwrap_err();
        assert!(matches!(err, ServeError::Inference(_)));
        assert_eq!(pool.live_workers(), 1);

        let items = pool.dispatch(vec![request("after")]).await.unwrap();
        assert_eq!(items[0].as_ref().unwrap().id.as_deref(), Some("after"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_errors() {
        let pool = pool(1, Duration::from_secs(1)).await;

        let items = pool.dispatch(vec![request("a"), request("error")]).await.unwrap();
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(ServeError::Inference(_))));

        let err = pool.dispatch(vec![request("fail-batch")]).await.unwrap_err();
        assert!(matches!(err, ServeError::Inference(_)));

        let err = pool.dispatch(vec![request("a"), request("short")]).await.unwrap_err();
        assert!(err.to_string().contains("1 responses for 2 requests"));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_and_rejects_new_work() {
        let pool = pool(1, Duration::from_secs(1)).await;

        let busy = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.dispatch(vec![request("slow")]).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        pool.shutdown().await;
        assert!(busy.await.unwrap().is_ok());
        assert_eq!(pool.live_workers(), 0);

        let err = pool.dispatch(vec![request("a")]).await.unwrap_err();
        assert!(matches!(err, ServeError::WorkerUnavailable(_)));
    }

    #[tokio::test]
    async fn test_start_fails_for_unknown_implementation() {
        let (runtimes, _) = scripted_registry();
        let settings = Arc::new(ModelSettings::builder("m", "missing").build().unwrap());

        let err = WorkerPool::start(settings, runtimes, pool_config(2)).await.err().unwrap();
        assert!(matches!(err, ServeError::Config(_)));
    }
}
