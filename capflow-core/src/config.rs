//! Configuration parsing and management.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Which persistence backend holds analysis state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-memory index persisted through an object store
    #[default]
    ObjectStore,
    /// One JSON document per analysis and per entity
    File,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::ObjectStore => write!(f, "object-store"),
            BackendKind::File => write!(f, "file"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "object-store" => Ok(BackendKind::ObjectStore),
            "file" => Ok(BackendKind::File),
            other => Err(ConfigError::InvalidValue {
                field: "backend",
                reason: format!("unknown backend \"{}\"", other),
            }),
        }
    }
}

/// Main configuration struct matching the capflow.yml schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapflowConfig {
    #[serde(default = "default_analysis_dir")]
    pub analysis_dir: PathBuf,

    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    #[serde(default = "default_purge_interval")]
    pub purge_interval_minutes: u64,

    #[serde(default = "default_script_extension")]
    pub script_extension: String,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_analysis_dir() -> PathBuf {
    PathBuf::from("./analyses")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./stateData")
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./stateData/snapshot")
}

fn default_purge_interval() -> u64 {
    720
}

fn default_script_extension() -> String {
    String::from("capl")
}

impl Default for CapflowConfig {
    fn default() -> Self {
        Self {
            analysis_dir: default_analysis_dir(),
            state_dir: default_state_dir(),
            backend: BackendKind::default(),
            snapshot_dir: default_snapshot_dir(),
            purge_interval_minutes: default_purge_interval(),
            script_extension: default_script_extension(),
            config_path: None,
        }
    }
}

impl CapflowConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;

        // Store config file path for relative path resolution
        config.config_path = Some(path.to_path_buf());

        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: CapflowConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.purge_interval_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "purge_interval_minutes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.script_extension.is_empty() || self.script_extension.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "script_extension",
                reason: format!("\"{}\" is not a file extension", self.script_extension),
            });
        }
        Ok(())
    }

    /// Directory holding `<analysisId>.<ext>` scripts
    pub fn analysis_dir(&self) -> PathBuf {
        self.resolve_path(&self.analysis_dir)
    }

    /// Directory holding file-backend state documents
    pub fn state_dir(&self) -> PathBuf {
        self.resolve_path(&self.state_dir)
    }

    /// Directory holding object-store snapshots
    pub fn snapshot_dir(&self) -> PathBuf {
        self.resolve_path(&self.snapshot_dir)
    }

    pub fn purge_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.purge_interval_minutes * 60)
    }

    /// Path of the script for `analysis_id`
    pub fn script_path(&self, analysis_id: &str) -> PathBuf {
        self.analysis_dir()
            .join(format!("{}.{}", analysis_id, self.script_extension))
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_path.as_deref().and_then(Path::parent) {
            Some(parent) => parent.join(path),
            None => path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = CapflowConfig::from_yaml("{}").unwrap();
        assert_eq!(config.backend, BackendKind::ObjectStore);
        assert_eq!(config.purge_interval_minutes, 720);
        assert_eq!(config.script_extension, "capl");
        assert_eq!(config.state_dir(), PathBuf::from("./stateData"));
    }

    #[test]
    fn test_parse_file_backend() {
        let yaml = "backend: file\nstate_dir: /var/lib/capflow\npurge_interval_minutes: 5\n";
        let config = CapflowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.backend, BackendKind::File);
        assert_eq!(config.state_dir(), PathBuf::from("/var/lib/capflow"));
        assert_eq!(config.purge_interval().as_secs(), 300);
    }

    #[test]
    fn test_zero_purge_interval_rejected() {
        let err = CapflowConfig::from_yaml("purge_interval_minutes: 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                field: "purge_interval_minutes",
                ..
            }
        ));
    }

    #[test]
    fn test_relative_paths_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capflow.yml");
        std::fs::write(&path, "analysis_dir: scripts\n").unwrap();

        let config = CapflowConfig::from_file(&path).unwrap();
        assert_eq!(config.analysis_dir(), dir.path().join("scripts"));
        assert_eq!(
            config.script_path("fraud"),
            dir.path().join("scripts").join("fraud.capl")
        );
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("file".parse::<BackendKind>().unwrap(), BackendKind::File);
        assert!("mongo".parse::<BackendKind>().is_err());
    }
}
