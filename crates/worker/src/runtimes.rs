//! Built-in runtimes
//!
//! `echo` returns its inputs as outputs. `sum` adds up every numeric element
//! of a request into a single FP64 output named `total`.

use crate::runtime::{ModelRuntime, RuntimeRegistry};
use anyhow::{anyhow, bail};
use tensorserve_common::ModelSettings;
use tensorserve_proto::{Datatype, InferenceRequest, InferenceResponse, NamedTensor, TensorData};

pub(crate) fn register_builtins(registry: &mut RuntimeRegistry) {
    registry.register("echo", |settings| Ok(Box::new(EchoRuntime::new(settings))));
    registry.register("sum", |settings| Ok(Box::new(SumRuntime::new(settings))));
}

fn response_for(name: &str, version: Option<&str>, outputs: Vec<NamedTensor>) -> InferenceResponse {
    let mut response = InferenceResponse::new(name, outputs);
    response.model_version = version.map(str::to_string);
    response
}

/// Returns every input unchanged
#[derive(Debug)]
pub struct EchoRuntime {
    name: String,
    version: Option<String>,
    loaded: bool,
}

impl EchoRuntime {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            name: settings.name.clone(),
            version: settings.version().map(str::to_string),
            loaded: false,
        }
    }
}

impl ModelRuntime for EchoRuntime {
    fn load(&mut self) -> anyhow::Result<()> {
        self.loaded = true;
        Ok(())
    }

    fn predict(&mut self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        if !self.loaded {
            bail!("model '{}' is not loaded", self.name);
        }
        Ok(response_for(&self.name, self.version.as_deref(), request.inputs))
    }

    fn unload(&mut self) -> anyhow::Result<()> {
        self.loaded = false;
        Ok(())
    }
}

/// Sums all numeric input elements
#[derive(Debug)]
pub struct SumRuntime {
    name: String,
    version: Option<String>,
}

impl SumRuntime {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            name: settings.name.clone(),
            version: settings.version().map(str::to_string),
        }
    }
}

impl ModelRuntime for SumRuntime {
    fn load(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn predict(&mut self, request: InferenceRequest) -> anyhow::Result<InferenceResponse> {
        let mut total = 0.0;
        for input in &request.inputs {
            let values = input
                .data
                .as_f64()
                .ok_or_else(|| anyhow!("input '{}' is not numeric", input.name))?;
            total += values.iter().sum::<f64>();
        }

        let output = NamedTensor::new("total", vec![1], Datatype::Fp64, TensorData::Float(vec![total]));
        Ok(response_for(&self.name, self.version.as_deref(), vec![output]))
    }
}
