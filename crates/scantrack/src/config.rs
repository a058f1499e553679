//! Study configuration.
//!
//! One TOML file per study describes the directory layout, the registered
//! study tags and their sites, scan types, the metadata backend and queue
//! flavor. The loaded [`StudyConfig`] value is passed explicitly to every
//! component that needs it; nothing in this crate probes global state to
//! decide which backend to talk to.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Config has no path entry named '{0}'")]
    MissingPath(String),

    #[error("Config has no [redcap] section")]
    MissingRedcap,
}

/// Which store backs the checklist and blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    /// Flat checklist.csv / blacklist.csv files under the metadata dir.
    File,
    /// The relational dashboard store.
    Dashboard,
}

/// Which cluster queue flavor to submit through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Piped `qbatch` submission.
    Qbatch,
    /// Script-file `sbatch` submission.
    Slurm,
}

/// A scan type registered for the study.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanTypeConfig {
    pub name: String,
    /// Derived/alias series, exempt from extra-scan deletion.
    #[serde(default)]
    pub linked: bool,
}

/// Metadata store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    /// Path to the dashboard SQLite database (dashboard backend).
    #[serde(default)]
    pub dashboard_db: Option<PathBuf>,
    /// User recorded for dashboard sign-offs and blacklist entries.
    #[serde(default = "default_user")]
    pub default_user: String,
}

fn default_user() -> String {
    "scantrack".to_string()
}

/// Queue submission settings.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueKind,
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_workdir() -> PathBuf {
    PathBuf::from("/tmp")
}

/// REDCap source settings for the scan-completed import.
#[derive(Debug, Clone, Deserialize)]
pub struct RedcapConfig {
    pub api_url: String,
    /// Token file name, relative to the metadata dir.
    pub token_file: String,
    pub project_id: String,
    pub instrument: String,
    pub date_field: String,
    pub status_field: String,
    pub status_values: Vec<String>,
    pub subject_field: String,
    pub comment_field: String,
    /// REDCap event name to dashboard event id.
    #[serde(default)]
    pub events: HashMap<String, i64>,
}

/// Per-study configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StudyConfig {
    /// Study nickname as registered in the dashboard.
    pub nickname: String,
    /// Study tag as it appears in subject identifiers.
    pub study_tag: String,
    /// Directory all path entries are resolved against.
    pub base_dir: PathBuf,
    /// Named directories (meta, dtifit, enigma, ...), relative to base_dir.
    pub paths: HashMap<String, PathBuf>,
    /// Study tag to registered site codes.
    pub study_tags: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub scantypes: Vec<ScanTypeConfig>,
    pub metadata: MetadataConfig,
    pub queue: QueueConfig,
    #[serde(default)]
    pub redcap: Option<RedcapConfig>,
}

impl StudyConfig {
    /// Load a study configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve a named path entry against the base directory.
    pub fn get_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        self.paths
            .get(name)
            .map(|p| self.base_dir.join(p))
            .ok_or_else(|| ConfigError::MissingPath(name.to_string()))
    }

    /// The metadata directory holding checklist.csv and blacklist.csv.
    pub fn meta_path(&self) -> Result<PathBuf, ConfigError> {
        self.get_path("meta")
    }

    /// The REDCap section, required by the redcap import.
    pub fn redcap(&self) -> Result<&RedcapConfig, ConfigError> {
        self.redcap.as_ref().ok_or(ConfigError::MissingRedcap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        nickname = "STUDY01"
        study_tag = "STU01"
        base_dir = "/archive/STUDY01"

        [paths]
        meta = "metadata"
        dtifit = "pipelines/dtifit"
        enigma = "pipelines/enigmaDTI"

        [study_tags]
        STU01 = ["SITE", "CMH"]

        [[scantypes]]
        name = "T1"

        [[scantypes]]
        name = "SPRL"
        linked = true

        [metadata]
        backend = "file"

        [queue]
        backend = "qbatch"
    "#;

    #[test]
    fn test_load_example() {
        let config: StudyConfig = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.nickname, "STUDY01");
        assert_eq!(config.metadata.backend, MetadataBackend::File);
        assert_eq!(config.queue.backend, QueueKind::Qbatch);
        assert_eq!(config.queue.cpu_cores, 1);
        assert!(config.scantypes[1].linked);
        assert_eq!(
            config.get_path("meta").unwrap(),
            PathBuf::from("/archive/STUDY01/metadata")
        );
        assert!(matches!(
            config.get_path("nope"),
            Err(ConfigError::MissingPath(_))
        ));
    }

    #[test]
    fn test_redcap_section_optional() {
        let config: StudyConfig = toml::from_str(EXAMPLE).unwrap();
        assert!(matches!(config.redcap(), Err(ConfigError::MissingRedcap)));
    }
}
