//! Wire-level request / response types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use tensorserve_common::config::MetadataTensor;

/// Header bag carried in `parameters.headers`
pub type Headers = BTreeMap<String, String>;

/// Tensor element type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Datatype {
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    Bytes,
}

impl Datatype {
    /// Protocol name of this datatype
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::Bool => "BOOL",
            Datatype::Uint8 => "UINT8",
            Datatype::Uint16 => "UINT16",
            Datatype::Uint32 => "UINT32",
            Datatype::Uint64 => "UINT64",
            Datatype::Int8 => "INT8",
            Datatype::Int16 => "INT16",
            Datatype::Int32 => "INT32",
            Datatype::Int64 => "INT64",
            Datatype::Fp16 => "FP16",
            Datatype::Fp32 => "FP32",
            Datatype::Fp64 => "FP64",
            Datatype::Bytes => "BYTES",
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, Datatype::Bool | Datatype::Bytes)
    }
}

/// Flattened tensor contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TensorData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
    Binary(Vec<Vec<u8>>),
}

impl TensorData {
    /// Number of elements
    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Int(v) => v.len(),
            TensorData::Float(v) => v.len(),
            TensorData::Text(v) => v.len(),
            TensorData::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric view of the data, if it is numeric
    pub fn as_f64(&self) -> Option<Vec<f64>> {
        match self {
            TensorData::Int(v) => Some(v.iter().map(|&x| x as f64).collect()),
            TensorData::Float(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Content type and header bag attached to requests, responses and tensors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A named tensor: request inputs and response outputs share this shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<u64>,
    pub datatype: Datatype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
    pub data: TensorData,
}

pub type RequestInput = NamedTensor;
pub type ResponseOutput = NamedTensor;

impl NamedTensor {
    pub fn new(name: impl Into<String>, shape: Vec<u64>, datatype: Datatype, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            datatype,
            parameters: None,
            data,
        }
    }

    /// Attach an explicit content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.parameters.get_or_insert_with(Parameters::default).content_type = Some(content_type.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.parameters.as_ref().and_then(|p| p.content_type.as_deref())
    }

    /// Number of elements the shape declares, `None` if it overflows
    pub fn element_count(&self) -> Option<u64> {
        self.shape.iter().try_fold(1u64, |count, &dim| count.checked_mul(dim))
    }
}

/// Output requested by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

/// One client inference call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,

    pub inputs: Vec<RequestInput>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<RequestOutput>>,
}

impl InferenceRequest {
    pub fn new(inputs: Vec<RequestInput>) -> Self {
        Self {
            inputs,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.parameters.as_ref().and_then(|p| p.content_type.as_deref())
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.parameters.as_ref().and_then(|p| p.headers.as_ref())
    }

    /// Header bag, created on first use
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.parameters
            .get_or_insert_with(Parameters::default)
            .headers
            .get_or_insert_with(Headers::new)
    }
}

/// Result of one inference call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub model_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,

    pub outputs: Vec<ResponseOutput>,
}

impl InferenceResponse {
    pub fn new(model_name: impl Into<String>, outputs: Vec<ResponseOutput>) -> Self {
        Self {
            model_name: model_name.into(),
            outputs,
            ..Self::default()
        }
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.parameters.as_ref().and_then(|p| p.headers.as_ref())
    }

    /// Header bag, created on first use
    pub fn headers_mut(&mut self) -> &mut Headers {
        self.parameters
            .get_or_insert_with(Parameters::default)
            .headers
            .get_or_insert_with(Headers::new)
    }
}

/// Server metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataServerResponse {
    pub name: String,
    pub version: String,
    pub extensions: Vec<String>,
}

/// Model metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataModelResponse {
    pub name: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub inputs: Vec<MetadataTensor>,
    #[serde(default)]
    pub outputs: Vec<MetadataTensor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

/// Repository index filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryIndexRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
}

/// State reported by the repository index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelAvailability {
    Unknown,
    Ready,
    Unavailable,
    Loading,
    Unloading,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryIndexItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub state: ModelAvailability,
    pub reason: String,
}

pub type RepositoryIndexResponse = Vec<RepositoryIndexItem>;
