//! Configuration structures for TensorServe
//!
//! Server-wide settings are loaded once from `settings.json` (or YAML) with
//! `TENSORSERVE_` environment overrides. Per-model descriptors come from
//! `model-settings.json` files found by the model repository. Both are plain
//! immutable structs validated once after loading; derived values are exposed
//! through accessors.

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the server-wide settings inside a repository folder
pub const DEFAULT_SETTINGS_FILENAME: &str = "settings.json";

/// Environment prefix for server settings
pub const ENV_PREFIX_SETTINGS: &str = "TENSORSERVE";

/// Environment prefix for the implicit default model
pub const ENV_PREFIX_MODEL_SETTINGS: &str = "TENSORSERVE_MODEL";

/// Default repository strategy key
pub const DEFAULT_REPOSITORY_IMPLEMENTATION: &str = "schemaless";

/// Longest accepted batch window, in seconds
pub const MAX_BATCH_TIME_SECS: f64 = 3600.0;

/// Server-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Name of the server, used in metadata and correlation headers
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Version of the server
    #[serde(default = "default_server_version")]
    pub server_version: String,

    /// Server extensions advertised in metadata
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Root of the model repository
    #[serde(default = "default_repository_root")]
    pub model_repository_root: PathBuf,

    /// Repository strategy key (see `ModelRepositoryFactory`)
    #[serde(default = "default_repository_implementation")]
    pub model_repository_implementation: String,

    /// Extra arguments handed to the repository strategy
    #[serde(default)]
    pub model_repository_implementation_args: BTreeMap<String, String>,

    /// Load every discovered model at startup
    #[serde(default = "default_true")]
    pub load_models_at_startup: bool,

    /// Number of execution workers per model
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,

    /// Grace period (seconds) for workers to finish when shutting down
    #[serde(default = "default_parallel_workers_timeout")]
    pub parallel_workers_timeout: u64,

    /// How long a dispatch may wait for an idle worker (milliseconds)
    #[serde(default = "default_worker_wait_timeout_ms")]
    pub worker_wait_timeout_ms: u64,

    /// Enable response caching (models must opt in too)
    #[serde(default)]
    pub cache_enabled: bool,

    /// Number of cached responses per server
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Emit JSON logs
    #[serde(default)]
    pub use_structured_logging: bool,

    /// Record Prometheus metrics; when off, `METRICS` stays untouched
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Metadata describing one input or output tensor of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTensor {
    pub name: String,
    pub datatype: String,
    #[serde(default)]
    pub shape: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Parameters that apply to one instance (version) of a model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Where the model artifacts live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Version of the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Format of the artifacts (runtime specific)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    /// Default content type for requests and responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Arbitrary runtime-specific settings
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Declarative description of a loadable model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Name of the model; defaults to the folder name during discovery
    #[serde(default)]
    pub name: String,

    /// Framework used to produce the model (e.g. "sklearn")
    #[serde(default)]
    pub platform: String,

    /// Versions of dependencies used to produce the model
    #[serde(default)]
    pub versions: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<MetadataTensor>,

    #[serde(default)]
    pub outputs: Vec<MetadataTensor>,

    /// Per-model override of the server's worker count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_workers: Option<usize>,

    /// Maximum number of requests grouped in one batch (0 disables batching)
    #[serde(default)]
    pub max_batch_size: usize,

    /// Maximum time in seconds a batch stays open
    #[serde(default)]
    pub max_batch_time: f64,

    /// Runtime key resolved through the runtime registry
    #[serde(default)]
    pub implementation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ModelParameters>,

    /// Opt this model into the response cache
    #[serde(default)]
    pub cache_enabled: bool,

    /// File this descriptor was read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_server_name() -> String {
    "tensorserve".to_string()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_repository_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_repository_implementation() -> String {
    DEFAULT_REPOSITORY_IMPLEMENTATION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_parallel_workers() -> usize {
    1
}

fn default_parallel_workers_timeout() -> u64 {
    5
}

fn default_worker_wait_timeout_ms() -> u64 {
    30_000
}

fn default_cache_size() -> usize {
    100
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            server_version: default_server_version(),
            extensions: Vec::new(),
            model_repository_root: default_repository_root(),
            model_repository_implementation: default_repository_implementation(),
            model_repository_implementation_args: BTreeMap::new(),
            load_models_at_startup: true,
            parallel_workers: default_parallel_workers(),
            parallel_workers_timeout: default_parallel_workers_timeout(),
            worker_wait_timeout_ms: default_worker_wait_timeout_ms(),
            cache_enabled: false,
            cache_size: default_cache_size(),
            use_structured_logging: false,
            metrics_enabled: true,
        }
    }
}

impl ServerSettings {
    /// Load configuration from a JSON or YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServeError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let settings: ServerSettings = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| {
                ServeError::config(format!("Failed to parse config file {}: {}", path.display(), e))
            })?,
            _ => serde_json::from_str(&content).map_err(|e| {
                ServeError::config(format!("Failed to parse config file {}: {}", path.display(), e))
            })?,
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings for a repository folder
    ///
    /// Reads `<folder>/settings.json` when present, applies `TENSORSERVE_*`
    /// environment overrides, and points the repository root at `folder`.
    pub fn load(folder: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&ServerSettings::default())?);

        if let Some(folder) = folder {
            let path = folder.join(DEFAULT_SETTINGS_FILENAME);
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let mut settings: ServerSettings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX_SETTINGS)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extensions"),
            )
            .build()?
            .try_deserialize()?;

        if let Some(folder) = folder {
            settings.model_repository_root = folder.to_path_buf();
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_name.is_empty() {
            return Err(ServeError::config("server_name must not be empty"));
        }
        if self.parallel_workers == 0 {
            return Err(ServeError::config("parallel_workers must be at least 1"));
        }
        if self.cache_enabled && self.cache_size == 0 {
            return Err(ServeError::config("cache_size must be > 0 when caching is enabled"));
        }
        Ok(())
    }

    /// Worker-wait budget as Duration
    pub fn worker_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_wait_timeout_ms)
    }

    /// Graceful-shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.parallel_workers_timeout)
    }
}

/// Flat view of the `TENSORSERVE_MODEL_*` environment variables
#[derive(Debug, Default, Deserialize)]
struct ModelEnv {
    name: Option<String>,
    implementation: Option<String>,
    version: Option<String>,
    uri: Option<String>,
    content_type: Option<String>,
    max_batch_size: Option<usize>,
    max_batch_time: Option<f64>,
}

impl ModelSettings {
    /// Start building model settings programmatically
    pub fn builder(name: impl Into<String>, implementation: impl Into<String>) -> ModelSettingsBuilder {
        ModelSettingsBuilder::new(name, implementation)
    }

    /// Parse a `model-settings.json` descriptor
    ///
    /// No defaulting happens here; see the repository loader for that.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut settings: ModelSettings = serde_json::from_str(&content)?;
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Build the implicit default model from `TENSORSERVE_MODEL_*` variables
    ///
    /// Fails when the environment does not name an implementation.
    pub fn from_env() -> Result<Self> {
        let env: ModelEnv = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX_MODEL_SETTINGS).try_parsing(true))
            .build()?
            .try_deserialize()?;

        let implementation = env
            .implementation
            .ok_or_else(|| ServeError::config("No default model found in environment settings"))?;

        let mut builder = ModelSettings::builder(env.name.unwrap_or_default(), implementation);
        if let Some(version) = env.version {
            builder = builder.version(version);
        }
        if let Some(uri) = env.uri {
            builder = builder.uri(uri);
        }
        if let Some(content_type) = env.content_type {
            builder = builder.content_type(content_type);
        }
        let max_batch_time = env.max_batch_time.unwrap_or(0.0);
        let window = batch_window(max_batch_time).ok_or_else(|| {
            ServeError::config(format!("invalid default model max_batch_time {}", max_batch_time))
        })?;
        builder = builder.max_batch_size(env.max_batch_size.unwrap_or(0));
        builder = builder.max_batch_time(window);
        builder.build_unnamed()
    }

    /// Version of this model instance, read through its parameters
    pub fn version(&self) -> Option<&str> {
        self.parameters.as_ref().and_then(|p| p.version.as_deref())
    }

    /// Artifact URI
    pub fn uri(&self) -> Option<&str> {
        self.parameters.as_ref().and_then(|p| p.uri.as_deref())
    }

    /// Per-model default content type
    pub fn default_content_type(&self) -> Option<&str> {
        self.parameters.as_ref().and_then(|p| p.content_type.as_deref())
    }

    /// Runtime-specific extra parameter
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters.as_ref().and_then(|p| p.extra.get(key))
    }

    /// Maximum batch wait as Duration; zero when the value is unusable
    pub fn max_batch_time(&self) -> Duration {
        batch_window(self.max_batch_time).unwrap_or_default()
    }

    /// Whether requests for this model go through adaptive batching
    pub fn batching_enabled(&self) -> bool {
        self.max_batch_size > 1 && self.max_batch_time > 0.0
    }

    /// Worker count for this model given the server default
    pub fn workers(&self, server_default: usize) -> usize {
        self.parallel_workers.unwrap_or(server_default).max(1)
    }

    /// Validate a fully resolved descriptor
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ServeError::config("model name must not be empty"));
        }
        self.validate_fields()
    }

    fn validate_fields(&self) -> Result<()> {
        if self.implementation.is_empty() {
            return Err(ServeError::config(format!(
                "model '{}' does not declare an implementation",
                self.name
            )));
        }
        if batch_window(self.max_batch_time).is_none() {
            return Err(ServeError::config(format!(
                "model '{}' has invalid max_batch_time {}",
                self.name, self.max_batch_time
            )));
        }
        if self.parallel_workers == Some(0) {
            return Err(ServeError::config(format!(
                "model '{}' must run at least one worker",
                self.name
            )));
        }
        Ok(())
    }
}

/// Batch window for a `max_batch_time` in seconds
///
/// `None` for negative, non-finite or unrepresentable values, and for windows
/// longer than [`MAX_BATCH_TIME_SECS`].
fn batch_window(seconds: f64) -> Option<Duration> {
    if !(0.0..=MAX_BATCH_TIME_SECS).contains(&seconds) {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// Builder for [`ModelSettings`]
#[derive(Debug, Clone)]
pub struct ModelSettingsBuilder {
    settings: ModelSettings,
}

impl ModelSettingsBuilder {
    fn new(name: impl Into<String>, implementation: impl Into<String>) -> Self {
        Self {
            settings: ModelSettings {
                name: name.into(),
                implementation: implementation.into(),
                ..ModelSettings::default()
            },
        }
    }

    fn parameters(&mut self) -> &mut ModelParameters {
        self.settings.parameters.get_or_insert_with(ModelParameters::default)
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.parameters().version = Some(version.into());
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.parameters().uri = Some(uri.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.parameters().content_type = Some(content_type.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters().extra.insert(key.into(), value);
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.settings.platform = platform.into();
        self
    }

    pub fn input(mut self, tensor: MetadataTensor) -> Self {
        self.settings.inputs.push(tensor);
        self
    }

    pub fn output(mut self, tensor: MetadataTensor) -> Self {
        self.settings.outputs.push(tensor);
        self
    }

    pub fn parallel_workers(mut self, workers: usize) -> Self {
        self.settings.parallel_workers = Some(workers);
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.settings.max_batch_size = size;
        self
    }

    pub fn max_batch_time(mut self, time: Duration) -> Self {
        self.settings.max_batch_time = time.as_secs_f64();
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.settings.cache_enabled = enabled;
        self
    }

    /// Validate and return the settings
    pub fn build(self) -> Result<ModelSettings> {
        self.settings.validate()?;
        Ok(self.settings)
    }

    /// Same as `build`, but allows the name to be filled in later
    pub fn build_unnamed(self) -> Result<ModelSettings> {
        self.settings.validate_fields()?;
        Ok(self.settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_settings_defaults() {
        let settings = ServerSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.parallel_workers, 1);
        assert_eq!(settings.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(settings.model_repository_implementation, "schemaless");
    }

    #[test]
    fn test_server_settings_validation() {
        let settings = ServerSettings {
            parallel_workers: 0,
            ..ServerSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_server_settings_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server_name": "edge", "parallel_workers": 3}"#).unwrap();

        let settings = ServerSettings::from_file(&path).unwrap();
        assert_eq!(settings.server_name, "edge");
        assert_eq!(settings.parallel_workers, 3);
        assert!(settings.load_models_at_startup);
    }

    #[test]
    fn test_server_settings_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "server_name: yaml-server\ncache_enabled: true\n").unwrap();

        let settings = ServerSettings::from_file(&path).unwrap();
        assert_eq!(settings.server_name, "yaml-server");
        assert!(settings.cache_enabled);
    }

    #[test]
    fn test_model_settings_parse() {
        let json = r#"{
            "name": "transformer",
            "implementation": "echo",
            "max_batch_size": 4,
            "max_batch_time": 0.05,
            "parameters": {"version": "v1", "extra": {"task": "text-generation"}}
        }"#;

        let settings: ModelSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.version(), Some("v1"));
        assert_eq!(settings.max_batch_time(), Duration::from_millis(50));
        assert!(settings.batching_enabled());
        assert_eq!(
            settings.extra("task"),
            Some(&serde_json::Value::String("text-generation".to_string()))
        );
    }

    #[test]
    fn test_builder_validation() {
        assert!(ModelSettings::builder("m", "").build().is_err());
        assert!(ModelSettings::builder("", "echo").build().is_err());
        assert!(ModelSettings::builder("", "echo").build_unnamed().is_ok());
        assert!(ModelSettings::builder("m", "echo").parallel_workers(0).build().is_err());

        let settings = ModelSettings::builder("m", "echo")
            .version("v2")
            .max_batch_size(3)
            .max_batch_time(Duration::from_millis(50))
            .build()
            .unwrap();
        assert_eq!(settings.version(), Some("v2"));
        assert_eq!(settings.workers(2), 2);
    }

    #[test]
    fn test_batch_time_out_of_range_is_rejected() {
        let huge: ModelSettings =
            serde_json::from_str(r#"{"name": "m", "implementation": "echo", "max_batch_size": 4, "max_batch_time": 1e20}"#)
                .unwrap();
        assert!(matches!(huge.validate(), Err(ServeError::Config(_))));
        assert_eq!(huge.max_batch_time(), Duration::ZERO);

        let negative: ModelSettings =
            serde_json::from_str(r#"{"name": "m", "implementation": "echo", "max_batch_time": -0.5}"#).unwrap();
        assert!(negative.validate().is_err());

        assert!(ModelSettings::builder("m", "echo")
            .max_batch_time(Duration::from_secs(7200))
            .build()
            .is_err());
        assert_eq!(batch_window(f64::NAN), None);
        assert_eq!(batch_window(MAX_BATCH_TIME_SECS), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_batching_disabled_by_default() {
        let settings = ModelSettings::builder("m", "echo").build().unwrap();
        assert!(!settings.batching_enabled());
    }
}
