//! Codec registry
//!
//! Maps a content-type tag to a converter between wire tensors and native
//! values. Resolution order for a tensor is: its own `content_type`
//! parameter, then the model's default content type, then untyped
//! passthrough of the raw data.

use crate::types::{Datatype, NamedTensor, TensorData};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tensorserve_common::error::{Result, ServeError};

/// Native value produced by decoding a tensor
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    /// UTF-8 strings
    Strings(Vec<String>),
    /// Raw byte arrays
    Bytes(Vec<Vec<u8>>),
    /// Structured values, one JSON document per element
    Json(Vec<serde_json::Value>),
    /// Untyped passthrough
    Raw(TensorData),
}

/// Bidirectional converter for one content type
pub trait Codec: Send + Sync {
    /// Content-type tag this codec is registered under
    fn content_type(&self) -> &'static str;

    /// Encode a native value into a named wire tensor
    fn encode(&self, name: &str, value: &NativeValue) -> Result<NamedTensor>;

    /// Decode a wire tensor into a native value
    fn decode(&self, tensor: &NamedTensor) -> Result<NativeValue>;
}

fn mismatch(codec: &str, expected: &str) -> ServeError {
    ServeError::invalid_input(format!("codec '{}' expects {}", codec, expected))
}

fn bytes_tensor(name: &str, content_type: &str, data: TensorData) -> NamedTensor {
    let len = data.len() as u64;
    NamedTensor::new(name, vec![len], Datatype::Bytes, data).with_content_type(content_type)
}

/// Strings carried as BYTES
pub struct StringCodec;

impl Codec for StringCodec {
    fn content_type(&self) -> &'static str {
        "str"
    }

    fn encode(&self, name: &str, value: &NativeValue) -> Result<NamedTensor> {
        match value {
            NativeValue::Strings(values) => {
                Ok(bytes_tensor(name, self.content_type(), TensorData::Text(values.clone())))
            }
            _ => Err(mismatch(self.content_type(), "a list of strings")),
        }
    }

    fn decode(&self, tensor: &NamedTensor) -> Result<NativeValue> {
        match &tensor.data {
            TensorData::Text(values) => Ok(NativeValue::Strings(values.clone())),
            TensorData::Binary(values) => values
                .iter()
                .map(|raw| {
                    String::from_utf8(raw.clone()).map_err(|e| {
                        ServeError::invalid_input(format!("input '{}' is not UTF-8: {}", tensor.name, e))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(NativeValue::Strings),
            _ => Err(mismatch(self.content_type(), "BYTES data")),
        }
    }
}

/// Raw byte arrays carried as BYTES
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn content_type(&self) -> &'static str {
        "bytes"
    }

    fn encode(&self, name: &str, value: &NativeValue) -> Result<NamedTensor> {
        match value {
            NativeValue::Bytes(values) => {
                Ok(bytes_tensor(name, self.content_type(), TensorData::Binary(values.clone())))
            }
            _ => Err(mismatch(self.content_type(), "a list of byte arrays")),
        }
    }

    fn decode(&self, tensor: &NamedTensor) -> Result<NativeValue> {
        match &tensor.data {
            TensorData::Binary(values) => Ok(NativeValue::Bytes(values.clone())),
            TensorData::Text(values) => Ok(NativeValue::Bytes(
                values.iter().map(|s| s.as_bytes().to_vec()).collect(),
            )),
            _ => Err(mismatch(self.content_type(), "BYTES data")),
        }
    }
}

/// Structured values, one serialized JSON document per element
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "json"
    }

    fn encode(&self, name: &str, value: &NativeValue) -> Result<NamedTensor> {
        match value {
            NativeValue::Json(values) => {
                let encoded = values
                    .iter()
                    .map(serde_json::to_string)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(bytes_tensor(name, self.content_type(), TensorData::Text(encoded)))
            }
            _ => Err(mismatch(self.content_type(), "a list of JSON values")),
        }
    }

    fn decode(&self, tensor: &NamedTensor) -> Result<NativeValue> {
        let parse = |raw: &[u8]| {
            serde_json::from_slice::<serde_json::Value>(raw).map_err(|e| {
                ServeError::invalid_input(format!("input '{}' is not valid JSON: {}", tensor.name, e))
            })
        };

        match &tensor.data {
            TensorData::Text(values) => values
                .iter()
                .map(|s| parse(s.as_bytes()))
                .collect::<Result<Vec<_>>>()
                .map(NativeValue::Json),
            TensorData::Binary(values) => values
                .iter()
                .map(|raw| parse(raw.as_slice()))
                .collect::<Result<Vec<_>>>()
                .map(NativeValue::Json),
            _ => Err(mismatch(self.content_type(), "BYTES data")),
        }
    }
}

/// Registry of codecs keyed by content type
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.codecs.keys().collect();
        tags.sort();
        f.debug_struct("CodecRegistry").field("content_types", &tags).finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(StringCodec));
        registry.register(Arc::new(BytesCodec));
        registry.register(Arc::new(JsonCodec));
        registry
    }
}

impl CodecRegistry {
    /// Registry without any codec
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Register a codec, replacing any codec with the same tag
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.content_type().to_string(), codec);
    }

    /// Registered content types
    pub fn content_types(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.codecs.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Look up a codec
    pub fn find(&self, content_type: &str) -> Result<Arc<dyn Codec>> {
        self.codecs
            .get(content_type)
            .cloned()
            .ok_or_else(|| ServeError::unsupported_content_type(content_type))
    }

    /// Resolve the content type of a tensor
    pub fn resolve<'a>(&self, tensor: &'a NamedTensor, model_default: Option<&'a str>) -> Option<&'a str> {
        tensor.content_type().or(model_default)
    }

    /// Encode a native value with the codec for `content_type`
    pub fn encode(&self, name: &str, value: &NativeValue, content_type: &str) -> Result<NamedTensor> {
        self.find(content_type)?.encode(name, value)
    }

    /// Decode a tensor; `None` means untyped passthrough
    pub fn decode(&self, tensor: &NamedTensor, content_type: Option<&str>) -> Result<NativeValue> {
        match content_type {
            Some(content_type) => self.find(content_type)?.decode(tensor),
            None => Ok(NativeValue::Raw(tensor.data.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_codec() {
        let registry = CodecRegistry::default();
        let samples = [
            ("str", NativeValue::Strings(vec!["hello".into(), "wörld".into()])),
            ("bytes", NativeValue::Bytes(vec![vec![0, 159, 146, 150], vec![]])),
            (
                "json",
                NativeValue::Json(vec![serde_json::json!({"generated_text": "hi"}), serde_json::json!([1, 2])]),
            ),
        ];

        for (content_type, value) in samples {
            let tensor = registry.encode("payload", &value, content_type).unwrap();
            assert_eq!(tensor.content_type(), Some(content_type));
            assert_eq!(tensor.element_count(), Some(tensor.data.len() as u64));

            let decoded = registry.decode(&tensor, Some(content_type)).unwrap();
            assert_eq!(decoded, value, "round trip failed for {}", content_type);
        }
    }

    #[test]
    fn test_unknown_content_type() {
        let registry = CodecRegistry::default();
        let tensor = NamedTensor::new("x", vec![1], Datatype::Bytes, TensorData::Text(vec!["a".into()]));

        let err = registry.decode(&tensor, Some("pandas")).unwrap_err();
        assert_eq!(err, ServeError::UnsupportedContentType("pandas".to_string()));
    }

    #[test]
    fn test_passthrough_without_content_type() {
        let registry = CodecRegistry::default();
        let tensor = NamedTensor::new("x", vec![2], Datatype::Fp32, TensorData::Float(vec![1.0, 2.0]));

        let decoded = registry.decode(&tensor, None).unwrap();
        assert_eq!(decoded, NativeValue::Raw(TensorData::Float(vec![1.0, 2.0])));
    }

    #[test]
    fn test_resolution_order() {
        let registry = CodecRegistry::default();
        let plain = NamedTensor::new("x", vec![1], Datatype::Bytes, TensorData::Text(vec!["a".into()]));
        let tagged = plain.clone().with_content_type("str");

        assert_eq!(registry.resolve(&tagged, Some("json")), Some("str"));
        assert_eq!(registry.resolve(&plain, Some("json")), Some("json"));
        assert_eq!(registry.resolve(&plain, None), None);
    }

    #[test]
    fn test_string_codec_rejects_numbers() {
        let registry = CodecRegistry::default();
        let tensor = NamedTensor::new("x", vec![1], Datatype::Fp32, TensorData::Float(vec![1.0]));
        assert!(matches!(
            registry.decode(&tensor, Some("str")),
            Err(ServeError::InvalidInput(_))
        ));
    }
}
