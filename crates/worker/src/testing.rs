//! Scripted runtime for unit tests
//!
//! Behaviour is chosen by request id: `panic` crashes the worker, `error`
//! fails that item, `fail-batch` fails the whole batch, `short` makes the
//! runtime return one response too few, `slow` sleeps before answering.

use crate::pool::PoolConfig;
use crate::runtime::{BatchItem, ModelRuntime, RuntimeRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tensorserve_common::ModelSettings;
use tensorserve_proto::{Datatype, InferenceRequest, InferenceResponse, NamedTensor, TensorData};

/// Batch sizes seen by every scripted runtime of a registry
pub(crate) type BatchLog = Arc<Mutex<Vec<usize>>>;

struct Scripted {
    name: String,
    batch_log: BatchLog,
}

impl ModelRuntime for Scripted {
    fn load(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn predict(&mut self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        match request.id.as_deref() {
            Some("panic") => panic!("scripted crash"),
            Some("error") => anyhow::bail!("scripted failure"),
            Some("slow") => std::thread::sleep(Duration::from_millis(150)),
            _ => {}
        }
        let mut response = InferenceResponse::new(self.name.clone(), request.inputs);
        response.id = request.id;
        Ok(response)
    }

    fn predict_batch(&mut self, requests: Vec<InferenceRequest>) -> anyhow::Result<Vec<BatchItem>> {
        self.batch_log.lock().push(requests.len());
        if requests.iter().any(|r| r.id.as_deref() == Some("fail-batch")) {
            anyhow::bail!("scripted batch failure");
        }
        let short = requests.iter().any(|r| r.id.as_deref() == Some("short"));
        let mut items: Vec<BatchItem> = requests.into_iter().map(|r| self.predict(r)).collect();
        if short {
            items.pop();
        }
        Ok(items)
    }
}

pub(crate) fn scripted_registry() -> (Arc<RuntimeRegistry>, BatchLog) {
    let batch_log: BatchLog = Arc::default();
    let mut registry = RuntimeRegistry::default();
    let shared = Arc::clone(&batch_log);
    registry.register("scripted", move |settings: &ModelSettings| {
        Ok(Box::new(Scripted {
            name: settings.name.clone(),
            batch_log: Arc::clone(&shared),
        }) as Box<dyn ModelRuntime>)
    });
    (Arc::new(registry), batch_log)
}

pub(crate) fn settings(max_batch_size: usize, max_batch_time: Duration) -> Arc<ModelSettings> {
    Arc::new(
        ModelSettings::builder("scripted-model", "scripted")
            .max_batch_size(max_batch_size)
            .max_batch_time(max_batch_time)
            .build()
            .unwrap(),
    )
}

pub(crate) fn pool_config(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        wait_budget: Duration::from_secs(2),
        grace: Duration::from_secs(2),
    }
}

pub(crate) fn request(id: &str) -> InferenceRequest {
    InferenceRequest::new(vec![NamedTensor::new(
        "x",
        vec![1],
        Datatype::Int64,
        TensorData::Int(vec![1]),
    )])
    .with_id(id)
}
