//! Data plane
//!
//! Protocol-level operations shared by every transport: health, metadata and
//! inference. Inference resolves the target model, validates and tags the
//! request, runs it through the model's batcher and stamps the response with
//! its id, model identity and correlation headers.

use crate::cache::{CacheKey, ResponseCache};
use crate::headers::{cloud_event_headers, insert_headers, set_headers, EventKind};
use crate::registry::ModelRegistry;
use std::sync::Arc;
use std::time::Instant;
use tensorserve_common::{Result, ServeError, ServerSettings, METRICS};
use tensorserve_proto::{
    CodecRegistry, Headers, InferenceRequest, InferenceResponse, MetadataModelResponse, MetadataServerResponse,
    NamedTensor, Parameters,
};
use tensorserve_worker::ModelInstance;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct DataPlane {
    settings: ServerSettings,
    registry: Arc<ModelRegistry>,
    codecs: Arc<CodecRegistry>,
    cache: Option<Arc<ResponseCache>>,
}

impl DataPlane {
    pub fn new(
        settings: ServerSettings,
        registry: Arc<ModelRegistry>,
        codecs: Arc<CodecRegistry>,
        cache: Option<Arc<ResponseCache>>,
    ) -> Self {
        Self {
            settings,
            registry,
            codecs,
            cache,
        }
    }

    /// The process is up
    pub fn live(&self) -> bool {
        true
    }

    /// Every loaded model is ready
    pub async fn ready(&self) -> bool {
        self.registry.all().await.iter().all(|model| model.ready())
    }

    pub async fn model_ready(&self, name: &str, version: Option<&str>) -> Result<bool> {
        let model = self.registry.get_model(name, version).await?;
        Ok(model.ready())
    }

    pub fn metadata(&self) -> MetadataServerResponse {
        MetadataServerResponse {
            name: self.settings.server_name.clone(),
            version: self.settings.server_version.clone(),
            extensions: self.settings.extensions.clone(),
        }
    }

    pub async fn model_metadata(&self, name: &str, version: Option<&str>) -> Result<MetadataModelResponse> {
        let model = self.registry.get_model(name, version).await?;
        let settings = model.settings();

        let parameters = settings.default_content_type().map(|content_type| Parameters {
            content_type: Some(content_type.to_string()),
            ..Parameters::default()
        });

        Ok(MetadataModelResponse {
            name: settings.name.clone(),
            versions: settings.versions.clone(),
            platform: settings.platform.clone(),
            inputs: settings.inputs.clone(),
            outputs: settings.outputs.clone(),
            parameters,
        })
    }

    pub async fn infer(
        &self,
        request: InferenceRequest,
        name: &str,
        version: Option<&str>,
    ) -> Result<InferenceResponse> {
        self.infer_with_headers(request, name, version, Headers::new()).await
    }

    /// Inference with headers received by the transport
    ///
    /// Transport headers are merged into the request's header bag without
    /// overwriting values the payload already carries.
    pub async fn infer_with_headers(
        &self,
        request: InferenceRequest,
        name: &str,
        version: Option<&str>,
        transport_headers: Headers,
    ) -> Result<InferenceResponse> {
        let started = Instant::now();
        METRICS.record(|m| m.inference.requests_total.inc());

        let result = self.run(request, name, version, transport_headers).await;

        METRICS.record(|m| m.inference.request_duration.observe(started.elapsed().as_secs_f64()));
        if let Err(e) = &result {
            METRICS.record(|m| m.inference.requests_failed.inc());
            debug!("Inference on model {} failed: {}", name, e);
        }
        result
    }

    async fn run(
        &self,
        mut request: InferenceRequest,
        name: &str,
        version: Option<&str>,
        transport_headers: Headers,
    ) -> Result<InferenceResponse> {
        let model = self.registry.get_model(name, version).await?;
        if !model.ready() {
            return Err(ServeError::model_not_ready(name, model.version()));
        }

        if !transport_headers.is_empty() {
            insert_headers(&mut request, transport_headers);
        }
        let request_id = request
            .id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        insert_headers(
            &mut request,
            cloud_event_headers(&self.settings.server_name, model.name(), &request_id, EventKind::Request),
        );

        self.validate(&mut request, &model)?;

        let cache_key = match &self.cache {
            Some(cache) if model.settings().cache_enabled => {
                let key = CacheKey::new(model.name(), model.version(), &request)?;
                if let Some(cached) = cache.lookup(&key) {
                    METRICS.record(|m| m.inference.cache_hits.inc());
                    debug!("Serving request {} for model {} from cache", request_id, model.name());
                    return Ok(self.finish(cached, &model, &request_id));
                }
                Some((Arc::clone(cache), key))
            }
            _ => None,
        };

        let response = model.infer(request).await?;
        let response = self.finish(response, &model, &request_id);

        if let Some((cache, key)) = cache_key {
            cache.insert(key, response.clone());
        }
        Ok(response)
    }

    /// Check shapes and codecs, tagging inputs with their resolved content type
    fn validate(&self, request: &mut InferenceRequest, model: &ModelInstance) -> Result<()> {
        if request.inputs.is_empty() {
            return Err(ServeError::invalid_input(format!(
                "request for model '{}' has no inputs",
                model.name()
            )));
        }

        let model_default = model.settings().default_content_type();
        for input in request.inputs.iter_mut() {
            check_shape(input)?;

            let content_type = self.codecs.resolve(input, model_default).map(str::to_string);
            if let Some(content_type) = content_type {
                self.codecs.decode(input, Some(&content_type))?;
                if input.content_type().is_none() {
                    input.parameters.get_or_insert_with(Parameters::default).content_type = Some(content_type);
                }
            }
        }
        Ok(())
    }

    fn finish(&self, mut response: InferenceResponse, model: &ModelInstance, request_id: &str) -> InferenceResponse {
        response.id = Some(request_id.to_string());
        response.model_name = model.name().to_string();
        response.model_version = model.version().map(str::to_string);

        match model.settings().default_content_type() {
            Some(content_type) if self.codecs.find(content_type).is_ok() => {
                for output in response.outputs.iter_mut().filter(|output| output.content_type().is_none()) {
                    output.parameters.get_or_insert_with(Parameters::default).content_type =
                        Some(content_type.to_string());
                }
            }
            Some(content_type) => warn!("Model {} declares unknown content type {}", model.name(), content_type),
            None => {}
        }

        set_headers(
            &mut response,
            cloud_event_headers(&self.settings.server_name, model.name(), request_id, EventKind::Response),
        );
        response
    }
}

fn check_shape(input: &NamedTensor) -> Result<()> {
    let declared = input.element_count().ok_or_else(|| {
        ServeError::invalid_input(format!(
            "input '{}' has shape {:?} whose element count overflows",
            input.name, input.shape
        ))
    })?;
    let actual = input.data.len() as u64;
    if declared != actual {
        return Err(ServeError::invalid_input(format!(
            "input '{}' has shape {:?} ({} elements) but carries {} values",
            input.name, input.shape, declared, actual
        )));
    }
    Ok(())
}
