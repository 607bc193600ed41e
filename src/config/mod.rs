/// Configuration snapshots for backupd.
///
/// A `Config` is parsed once from YAML and never mutated afterwards.
/// Reloading builds a fresh snapshot and swaps it into a `SharedConfig`,
/// so runs already in flight keep the snapshot they started with.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{BackupError, Result};

/// File name looked up in the default search locations.
pub const CONFIG_FILE_NAME: &str = "backupd.yml";

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root for daemon state. Retention ledgers live in `<data_dir>/cycler`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Backup models keyed by name.
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// One named backup model.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Filled from the map key.
    #[serde(skip)]
    pub name: String,
    /// Base directory for relative storage paths.
    #[serde(default)]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub storages: BTreeMap<String, StorageConfig>,
}

/// One storage destination of a model.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Filled from the map key.
    #[serde(skip)]
    pub name: String,
    /// Backend kind (`local`, `s3`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Generations to retain. 0 disables eviction.
    #[serde(default)]
    pub keep: usize,
    /// Backend-specific settings, handed to the backend untouched.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".backupd"))
        .unwrap_or_else(|| std::env::temp_dir().join("backupd"))
}

impl Config {
    /// Parse a YAML document. Relative `work_dir`s resolve against `base_dir`.
    pub fn from_yaml_str(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config = serde_yaml_ng::from_str(contents)
            .map_err(|e| BackupError::Config(format!("invalid configuration: {e}")))?;

        for (model_name, model) in config.models.iter_mut() {
            model.name = model_name.clone();
            if model.work_dir.as_os_str().is_empty() {
                model.work_dir = base_dir.to_path_buf();
            } else if model.work_dir.is_relative() {
                model.work_dir = base_dir.join(&model.work_dir);
            }
            for (storage_name, storage) in model.storages.iter_mut() {
                storage.name = storage_name.clone();
                if storage.kind.trim().is_empty() {
                    return Err(BackupError::Config(format!(
                        "storage {model_name}.{storage_name} has an empty type"
                    )));
                }
            }
        }

        Ok(config)
    }

    /// Load from an explicit path, or from the first default location that exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::search_paths()
                .into_iter()
                .find(|p| p.is_file())
                .ok_or_else(|| {
                    BackupError::Config(format!("no {CONFIG_FILE_NAME} found in default locations"))
                })?,
        };

        debug!(path = %path.display(), "Reading configuration");
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = Self::from_yaml_str(&contents, &base_dir)?;
        info!(
            path = %path.display(),
            models = config.models.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Default lookup order: working directory, then home, then `/etc`.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dirs) = directories::BaseDirs::new() {
            paths.push(dirs.home_dir().join(".backupd").join(CONFIG_FILE_NAME));
        }
        paths.push(PathBuf::from("/etc/backupd").join(CONFIG_FILE_NAME));
        paths
    }

    pub fn model(&self, name: &str) -> Result<&ModelConfig> {
        self.models
            .get(name)
            .ok_or_else(|| BackupError::NotFound(format!("model {name}")))
    }

    /// Directory holding the per-(model, storage) retention ledgers.
    pub fn cycler_dir(&self) -> PathBuf {
        self.data_dir.join("cycler")
    }
}

impl ModelConfig {
    pub fn storage(&self, name: &str) -> Result<&StorageConfig> {
        self.storages
            .get(name)
            .ok_or_else(|| BackupError::NotFound(format!("storage {}.{name}", self.name)))
    }
}

impl StorageConfig {
    /// A string setting, if present.
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    /// A string setting that the backend cannot work without.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.setting_str(key).ok_or_else(|| {
            BackupError::Config(format!(
                "storage {} ({}) is missing required setting `{key}`",
                self.name, self.kind
            ))
        })
    }
}

/// Process-wide handle to the current configuration snapshot.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The snapshot in effect right now.
    pub fn current(&self) -> Arc<Config> {
        let guard = self.inner.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the snapshot, returning the previous one.
    pub fn swap(&self, config: Config) -> Arc<Config> {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *guard, Arc::new(config))
    }

    /// Re-read the configuration and swap it in. The old snapshot stays active on error.
    pub fn reload(&self, path: Option<&Path>) -> Result<()> {
        let config = Config::load(path)?;
        self.swap(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
data_dir: /var/lib/backupd
models:
  mydb:
    work_dir: mydb
    storages:
      disk:
        type: local
        keep: 3
        path: backups
      offsite:
        type: s3
        bucket: archive
        region: us-east-1
  plain:
    storages: {}
"#;

    #[test]
    fn test_parse_fills_names_and_defaults() {
        let config = Config::from_yaml_str(SAMPLE, Path::new("/etc/backupd")).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/backupd"));
        assert_eq!(config.cycler_dir(), PathBuf::from("/var/lib/backupd/cycler"));

        let model = config.model("mydb").unwrap();
        assert_eq!(model.name, "mydb");
        assert_eq!(model.work_dir, PathBuf::from("/etc/backupd/mydb"));

        let disk = model.storage("disk").unwrap();
        assert_eq!(disk.name, "disk");
        assert_eq!(disk.kind, "local");
        assert_eq!(disk.keep, 3);
        assert_eq!(disk.setting_str("path"), Some("backups"));

        let offsite = model.storage("offsite").unwrap();
        assert_eq!(offsite.keep, 0);
        assert_eq!(offsite.require_str("bucket").unwrap(), "archive");
        assert!(offsite.require_str("endpoint").is_err());
    }

    #[test]
    fn test_missing_work_dir_uses_base_dir() {
        let config = Config::from_yaml_str(SAMPLE, Path::new("/srv")).unwrap();
        assert_eq!(config.model("plain").unwrap().work_dir, PathBuf::from("/srv"));
    }

    #[test]
    fn test_unknown_names_are_not_found() {
        let config = Config::from_yaml_str(SAMPLE, Path::new("/")).unwrap();
        assert!(matches!(config.model("nope"), Err(BackupError::NotFound(_))));
        let model = config.model("mydb").unwrap();
        assert!(matches!(model.storage("nope"), Err(BackupError::NotFound(_))));
    }

    #[test]
    fn test_storage_without_type_rejected() {
        let yaml = "models:\n  m:\n    storages:\n      s:\n        keep: 1\n";
        let err = Config::from_yaml_str(yaml, Path::new("/")).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "models:\n  m:\n    storages:\n      s:\n        type: local\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.model("m").unwrap().work_dir, dir.path());
    }

    #[test]
    fn test_shared_config_swap() {
        let first = Config::from_yaml_str(SAMPLE, Path::new("/")).unwrap();
        let shared = SharedConfig::new(first);
        let held = shared.current();
        assert_eq!(held.models.len(), 2);

        let second = Config::from_yaml_str("models: {}", Path::new("/")).unwrap();
        let previous = shared.swap(second);

        assert_eq!(previous.models.len(), 2);
        assert!(shared.current().models.is_empty());
        // Snapshots handed out earlier are unaffected.
        assert_eq!(held.models.len(), 2);
    }
}
