//! Response cache
//!
//! LRU of inference responses keyed by model, version and the serialized
//! request inputs.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use tensorserve_common::{Result, ServeError};
use tensorserve_proto::{InferenceRequest, InferenceResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: String,
    version: Option<String>,
    inputs: String,
}

impl CacheKey {
    pub fn new(model: &str, version: Option<&str>, request: &InferenceRequest) -> Result<Self> {
        Ok(Self {
            model: model.to_string(),
            version: version.map(str::to_string),
            inputs: serde_json::to_string(&request.inputs)?,
        })
    }
}

pub struct ResponseCache {
    entries: Mutex<LruCache<CacheKey, InferenceResponse>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| ServeError::config("cache_size must be > 0 when caching is enabled"))?;
        Ok(Self {
            entries: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<InferenceResponse> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, response: InferenceResponse) {
        self.entries.lock().put(key, response);
    }

    /// Forget every entry of a model
    pub fn invalidate(&self, model: &str) {
        let mut entries = self.entries.lock();
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.model == model)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            entries.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorserve_proto::{Datatype, NamedTensor, TensorData};

    fn request(value: i64) -> InferenceRequest {
        InferenceRequest::new(vec![NamedTensor::new(
            "x",
            vec![1],
            Datatype::Int64,
            TensorData::Int(vec![value]),
        )])
    }

    #[test]
    fn test_key_ignores_request_id() {
        let a = CacheKey::new("m", None, &request(1).with_id("a")).unwrap();
        let b = CacheKey::new("m", None, &request(1).with_id("b")).unwrap();
        let c = CacheKey::new("m", Some("v2"), &request(1)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ResponseCache::new(2).unwrap();
        for value in 0..3 {
            let key = CacheKey::new("m", None, &request(value)).unwrap();
            cache.insert(key, InferenceResponse::new("m", vec![]));
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&CacheKey::new("m", None, &request(0)).unwrap()).is_none());
        assert!(cache.lookup(&CacheKey::new("m", None, &request(2)).unwrap()).is_some());
    }

    #[test]
    fn test_invalidate_model() {
        let cache = ResponseCache::new(4).unwrap();
        cache.insert(CacheKey::new("a", None, &request(1)).unwrap(), InferenceResponse::new("a", vec![]));
        cache.insert(CacheKey::new("b", None, &request(1)).unwrap(), InferenceResponse::new("b", vec![]));

        cache.invalidate("a");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(ResponseCache::new(0), Err(ServeError::Config(_))));
    }
}
