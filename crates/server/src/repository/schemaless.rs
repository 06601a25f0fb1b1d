//! Filesystem repository
//!
//! Walks a root folder for `model-settings.json` descriptors. A descriptor
//! without a name takes its folder's name, and one without a URI points at
//! its own folder.

use super::ModelRepository;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tensorserve_common::config::ModelParameters;
use tensorserve_common::{ModelSettings, Result, ServeError};
use tracing::{debug, error, warn};

/// Descriptor file name searched for under the root
pub const DEFAULT_MODEL_SETTINGS_FILENAME: &str = "model-settings.json";

/// Discovers models by scanning a folder tree
#[derive(Debug, Clone)]
pub struct SchemalessModelRepository {
    root: PathBuf,
}

impl SchemalessModelRepository {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ModelRepository for SchemalessModelRepository {
    async fn list(&self) -> Result<Vec<ModelSettings>> {
        let root = self.root.clone();
        let discovered = tokio::task::spawn_blocking(move || discover(&root))
            .await
            .map_err(|e| ServeError::internal(format!("model discovery task failed: {}", e)))?;

        match discovered {
            Ok(found) if !found.is_empty() => Ok(found),
            Ok(_) => {
                debug!("No models were found in repository at {}", self.root.display());
                match default_from_env(&self.root) {
                    Ok(settings) => Ok(vec![settings]),
                    Err(e) => {
                        debug!("No default model found in environment settings: {}", e);
                        Ok(Vec::new())
                    }
                }
            }
            Err(e) => match default_from_env(&self.root) {
                Ok(settings) => {
                    warn!("{}; serving the default model from the environment", e);
                    Ok(vec![settings])
                }
                Err(_) => Err(e),
            },
        }
    }
}

/// Descriptors under `root`, sorted by path
///
/// A missing or unreadable root fails with `Discovery`; descriptors that fail
/// to parse are logged and skipped.
fn discover(root: &Path) -> Result<Vec<ModelSettings>> {
    let root = root
        .canonicalize()
        .map_err(|e| ServeError::discovery(root.display().to_string(), e.to_string()))?;

    let mut paths = Vec::new();
    collect_descriptors(&root, &mut paths)
        .map_err(|e| ServeError::discovery(root.display().to_string(), e.to_string()))?;
    paths.sort();

    let mut found = Vec::with_capacity(paths.len());
    for path in paths {
        match load_model_settings(&path) {
            Ok(settings) => found.push(settings),
            Err(e) => error!("Failed to load model settings at {}: {}", path.display(), e),
        }
    }
    Ok(found)
}

fn collect_descriptors(dir: &Path, paths: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if let Err(e) = collect_descriptors(&path, paths) {
                warn!("Skipping unreadable folder {}: {}", path.display(), e);
            }
        } else if entry.file_name() == DEFAULT_MODEL_SETTINGS_FILENAME {
            paths.push(path);
        }
    }
    Ok(())
}

/// Parse one descriptor and fill in folder-derived defaults
pub fn load_model_settings(path: &Path) -> Result<ModelSettings> {
    let mut settings = ModelSettings::from_file(path)?;

    let folder = path.parent().unwrap_or_else(|| Path::new("."));
    let folder_name = folder
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    if settings.name.is_empty() {
        settings.name = folder_name;
    } else if !folder_matches(&folder_name, &settings) {
        warn!(
            "Model name '{}' is different than model's folder name '{}'",
            settings.name, folder_name
        );
    }

    let parameters = settings.parameters.get_or_insert_with(ModelParameters::default);
    if parameters.uri.as_deref().map_or(true, str::is_empty) {
        parameters.uri = Some(folder.display().to_string());
    }

    settings
        .validate()
        .map_err(|e| ServeError::discovery(path.display().to_string(), e.to_string()))?;
    Ok(settings)
}

/// A folder may carry the model's name or, Triton-style, its version
fn folder_matches(folder_name: &str, settings: &ModelSettings) -> bool {
    settings.name == folder_name || settings.version() == Some(folder_name)
}

/// Implicit descriptor built from `TENSORSERVE_MODEL_*` variables
fn default_from_env(root: &Path) -> Result<ModelSettings> {
    let mut settings = ModelSettings::from_env()?;
    if settings.name.is_empty() {
        settings.name = root
            .canonicalize()
            .ok()
            .and_then(|root| root.file_name().map(|name| name.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "default".to_string());
    }
    settings.parameters.get_or_insert_with(ModelParameters::default);
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_descriptor(root: &Path, folder: &str, json: &str) -> PathBuf {
        let dir = root.join(folder);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DEFAULT_MODEL_SETTINGS_FILENAME);
        fs::write(&path, json).unwrap();
        path
    }

    #[tokio::test]
    async fn test_name_defaults_to_folder() {
        let root = TempDir::new().unwrap();
        write_descriptor(root.path(), "sentiment", r#"{"implementation": "echo"}"#);

        let repository = SchemalessModelRepository::new(root.path());
        let models = repository.list().await.unwrap();

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "sentiment");
        let uri = models[0].uri().unwrap();
        assert!(uri.ends_with("sentiment"), "unexpected uri {}", uri);
    }

    #[tokio::test]
    async fn test_nested_versions_and_explicit_uri() {
        let root = TempDir::new().unwrap();
        write_descriptor(
            root.path(),
            "iris/v1",
            r#"{"name": "iris", "implementation": "echo", "parameters": {"version": "v1"}}"#,
        );
        write_descriptor(
            root.path(),
            "iris/v2",
            r#"{"name": "iris", "implementation": "echo", "parameters": {"version": "v2", "uri": "/models/iris.bin"}}"#,
        );

        let repository = SchemalessModelRepository::new(root.path());
        let found = repository.find("iris").await.unwrap();

        let versions: Vec<_> = found.iter().map(|s| s.version().unwrap().to_string()).collect();
        assert_eq!(versions, vec!["v1", "v2"]);
        assert_eq!(found[1].uri(), Some("/models/iris.bin"));
    }

    #[tokio::test]
    async fn test_broken_descriptor_is_skipped() {
        let root = TempDir::new().unwrap();
        write_descriptor(root.path(), "good", r#"{"implementation": "echo"}"#);
        write_descriptor(root.path(), "bad", "{ not json");

        let repository = SchemalessModelRepository::new(root.path());
        let models = repository.list().await.unwrap();

        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "good");
    }

    #[tokio::test]
    async fn test_find_unknown_model() {
        let root = TempDir::new().unwrap();
        write_descriptor(root.path(), "sentiment", r#"{"implementation": "echo"}"#);

        let repository = SchemalessModelRepository::new(root.path());
        let err = repository.find("ghost").await.unwrap_err();
        assert!(matches!(err, ServeError::ModelNotFound { .. }));
    }

    #[tokio::test]
    async fn test_missing_root_is_a_discovery_error() {
        let root = TempDir::new().unwrap();
        let repository = SchemalessModelRepository::new(root.path().join("missing"));

        let err = repository.list().await.unwrap_err();
        assert!(matches!(err, ServeError::Discovery { .. }));
    }

    #[test]
    fn test_mismatched_name_is_kept() {
        let root = TempDir::new().unwrap();
        let path = write_descriptor(root.path(), "folder", r#"{"name": "other", "implementation": "echo"}"#);

        let settings = load_model_settings(&path).unwrap();
        assert_eq!(settings.name, "other");
        assert!(!folder_matches("folder", &settings));
    }
}
