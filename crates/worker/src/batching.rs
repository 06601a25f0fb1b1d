//! Adaptive batching with a size trigger and a wait timer
//!
//! Requests for a model are grouped into an open batch. The batch closes when
//! it reaches `max_batch_size` or when `max_batch_time` has passed since its
//! first request, whichever comes first. Exactly one of the two triggers
//! closes a batch; the other becomes a no-op. Responses are fanned back to
//! callers in batch order.

use crate::pool::WorkerPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tensorserve_common::{ModelSettings, Result, ServeError, METRICS};
use tensorserve_proto::{InferenceRequest, InferenceResponse};
use tokio::sync::{oneshot, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Batch identifier
pub type BatchId = u64;

/// Why a batch was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    Size,
    Timer,
    Flush,
}

impl CloseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTrigger::Size => "size",
            CloseTrigger::Timer => "timer",
            CloseTrigger::Flush => "flush",
        }
    }
}

/// Counters of one batcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: u64,
    pub requests: u64,
    pub closed_by_size: u64,
    pub closed_by_timer: u64,
    pub closed_by_flush: u64,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    requests: AtomicU64,
    size: AtomicU64,
    timer: AtomicU64,
    flush: AtomicU64,
}

/// A request waiting in a batch
struct PendingRequest {
    id: u64,
    request: InferenceRequest,
    reply: oneshot::Sender<Result<InferenceResponse>>,
    arrival_time: Instant,
}

/// Requests grouped for one worker call
struct RequestBatch {
    id: BatchId,
    creation_time: Instant,
    requests: Vec<PendingRequest>,
    timer: AbortHandle,
}

impl RequestBatch {
    fn len(&self) -> usize {
        self.requests.len()
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn age(&self) -> Duration {
        self.creation_time.elapsed()
    }
}

/// Groups requests for one model into batches
pub struct AdaptiveBatcher {
    model: String,
    max_batch_size: usize,
    max_batch_time: Duration,
    pool: Arc<WorkerPool>,
    open: Mutex<Option<RequestBatch>>,
    next_batch: AtomicU64,
    next_request: AtomicU64,
    counters: Counters,
    /// Batches and single calls currently at a worker
    dispatching: AtomicUsize,
    settled: Notify,
}

impl AdaptiveBatcher {
    pub fn new(settings: &ModelSettings, pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            model: settings.name.clone(),
            max_batch_size: settings.max_batch_size,
            max_batch_time: settings.max_batch_time(),
            pool,
            open: Mutex::new(None),
            next_batch: AtomicU64::new(0),
            next_request: AtomicU64::new(0),
            counters: Counters::default(),
            dispatching: AtomicUsize::new(0),
            settled: Notify::new(),
        })
    }

    /// Whether requests are grouped at all
    pub fn enabled(&self) -> bool {
        self.max_batch_size > 1 && !self.max_batch_time.is_zero()
    }

    /// Submit one request and wait for its response
    ///
    /// Dropping the returned future before the batch is dispatched removes the
    /// request from its batch.
    pub async fn submit(self: &Arc<Self>, request: InferenceRequest) -> Result<InferenceResponse> {
        if !self.enabled() {
            return self.dispatch_single(request).await;
        }

        let (reply, response) = oneshot::channel();
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (batch_id, full) = {
            let mut open = self.open.lock();
            let batch = open.get_or_insert_with(|| self.open_batch());
            batch.requests.push(PendingRequest {
                id,
                request,
                reply,
                arrival_time: Instant::now(),
            });
            let batch_id = batch.id;
            trace!("Request {} joined batch {} ({} queued)", id, batch_id, batch.len());
            let full = if batch.len() >= self.max_batch_size { open.take() } else { None };
            (batch_id, full)
        };

        if let Some(batch) = full {
            self.close(batch, CloseTrigger::Size);
        }

        let _pending = PendingGuard {
            batcher: self,
            batch_id,
            request_id: id,
        };

        match response.await {
            Ok(result) => result,
            Err(_) => Err(ServeError::internal(format!(
                "batch {} of model '{}' was dropped before replying",
                batch_id, self.model
            ))),
        }
    }

    fn open_batch(self: &Arc<Self>) -> RequestBatch {
        let id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        // No timer when the deadline is beyond the clock; size or flush closes it
        let deadline = Instant::now().checked_add(self.max_batch_time);
        let batcher: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
            if let Some(batcher) = batcher.upgrade() {
                batcher.close_expired(id);
            }
        })
        .abort_handle();

        RequestBatch {
            id,
            creation_time: Instant::now(),
            requests: Vec::with_capacity(self.max_batch_size.min(64)),
            timer,
        }
    }

    fn close_expired(self: &Arc<Self>, batch_id: BatchId) {
        let batch = {
            let mut open = self.open.lock();
            match open.as_ref() {
                Some(batch) if batch.id == batch_id => open.take(),
                _ => None,
            }
        };
        if let Some(batch) = batch {
            self.close(batch, CloseTrigger::Timer);
        }
    }

    /// Close the open batch now, if any
    pub fn flush(self: &Arc<Self>) {
        let batch = self.open.lock().take();
        if let Some(batch) = batch {
            self.close(batch, CloseTrigger::Flush);
        }
    }

    /// Flush and wait until nothing is at a worker any more
    pub async fn drain(self: &Arc<Self>) {
        self.flush();
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.dispatching.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }

    fn close(self: &Arc<Self>, batch: RequestBatch, trigger: CloseTrigger) {
        batch.timer.abort();
        if batch.is_empty() {
            return;
        }

        let size = batch.len();
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        self.counters.requests.fetch_add(size as u64, Ordering::Relaxed);
        let counter = match trigger {
            CloseTrigger::Size => &self.counters.size,
            CloseTrigger::Timer => &self.counters.timer,
            CloseTrigger::Flush => &self.counters.flush,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        METRICS.record(|m| m.batching.batch_size.observe(size as f64));
        METRICS.record(|m| m.batching.batches_closed.with_label_values(&[trigger.as_str()]).inc());

        debug!(
            "Closing batch {} of model {} with {} requests after {:?} ({})",
            batch.id,
            self.model,
            size,
            batch.age(),
            trigger.as_str()
        );

        let (requests, replies): (Vec<_>, Vec<_>) = batch
            .requests
            .into_iter()
            .map(|pending| {
                METRICS.record(|m| m.batching.queue_time.observe(pending.arrival_time.elapsed().as_secs_f64()));
                (pending.request, pending.reply)
            })
            .unzip();

        let in_flight = DispatchGuard::new(Arc::clone(self));
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            match pool.dispatch(requests).await {
                Ok(items) => {
                    for (reply, item) in replies.into_iter().zip(items) {
                        let _ = reply.send(item);
                    }
                }
                Err(e) => {
                    for reply in replies {
                        let _ = reply.send(Err(e.clone()));
                    }
                }
            }
        });
    }

    async fn dispatch_single(self: &Arc<Self>, request: InferenceRequest) -> Result<InferenceResponse> {
        let _in_flight = DispatchGuard::new(Arc::clone(self));
        let mut items = self.pool.dispatch(vec![request]).await?;
        items.pop().unwrap_or_else(|| {
            Err(ServeError::internal(format!(
                "model '{}' returned no response",
                self.model
            )))
        })
    }

    /// Counters since creation
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.counters.batches.load(Ordering::Relaxed),
            requests: self.counters.requests.load(Ordering::Relaxed),
            closed_by_size: self.counters.size.load(Ordering::Relaxed),
            closed_by_timer: self.counters.timer.load(Ordering::Relaxed),
            closed_by_flush: self.counters.flush.load(Ordering::Relaxed),
        }
    }

    /// Requests waiting in the open batch
    pub fn queued(&self) -> usize {
        self.open.lock().as_ref().map(RequestBatch::len).unwrap_or(0)
    }
}

/// Removes a request from its batch if the caller goes away before dispatch
struct PendingGuard<'a> {
    batcher: &'a AdaptiveBatcher,
    batch_id: BatchId,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut open = self.batcher.open.lock();
        let emptied = match open.as_mut() {
            Some(batch) if batch.id == self.batch_id => {
                let before = batch.len();
                batch.requests.retain(|pending| pending.id != self.request_id);
                if batch.len() < before {
                    trace!("Request {} left batch {} before dispatch", self.request_id, self.batch_id);
                }
                batch.is_empty()
            }
            _ => false,
        };
        if emptied {
            if let Some(batch) = open.take() {
                batch.timer.abort();
            }
        }
    }
}

/// Counts a batch or single call while it is at a worker
struct DispatchGuard {
    batcher: Arc<AdaptiveBatcher>,
}

impl DispatchGuard {
    fn new(batcher: Arc<AdaptiveBatcher>) -> Self {
        batcher.dispatching.fetch_add(1, Ordering::SeqCst);
        Self { batcher }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.batcher.dispatching.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.batcher.settled.notify_waiters();
        }
    }
}
