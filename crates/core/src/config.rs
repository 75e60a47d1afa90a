//! TOML-based configuration for a sync run.
//!
//! A [`BaseConfig`] binds the source and destination checkouts (path,
//! branch, root path prefixes) and carries the optional [`SyncOptions`]
//! tuning one run of the engine. Configs can equally be built in code;
//! the CLI loads them from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// One side of the sync: a checkout path, the branch (or bookmark) to
/// operate on, and the root path prefixes in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Filesystem path of the working copy.
    pub path: PathBuf,

    /// Branch (git) or bookmark (hg) to sync.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Path prefixes restricting which files are in scope. Empty means the
    /// whole tree.
    #[serde(default)]
    pub roots: Vec<String>,
}

fn default_branch() -> String {
    "master".into()
}

/// Optional knobs for one sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Explicit first source commit to sync, overriding resume discovery.
    #[serde(default)]
    pub first_commit: Option<String>,

    /// Source commit id prefixes to skip unconditionally.
    #[serde(default)]
    pub skip_source_commits: Vec<String>,

    /// Directory to write rendered patches into for debugging.
    #[serde(default)]
    pub patches_directory: Option<PathBuf>,

    /// Where to write the JSON stats record. If this is a directory, a
    /// `<branch>.json` file is created inside it.
    #[serde(default)]
    pub stats_file: Option<PathBuf>,
}

/// Top-level configuration: both endpoints plus sync options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseConfig {
    pub source: EndpointConfig,
    pub destination: EndpointConfig,

    #[serde(default)]
    pub sync: SyncOptions,

    /// Dump changeset debug messages as commits are processed.
    #[serde(skip)]
    pub verbose: bool,
}

impl BaseConfig {
    /// Load a [`BaseConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: BaseConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source.path".into(),
                detail: "source path must not be empty".into(),
            });
        }
        if self.destination.path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "destination.path".into(),
                detail: "destination path must not be empty".into(),
            });
        }
        if self.source.branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "source.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if self.destination.branch.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "destination.branch".into(),
                detail: "branch must not be empty".into(),
            });
        }
        if self.sync.first_commit.as_deref() == Some("") {
            return Err(ConfigError::InvalidValue {
                field: "sync.first_commit".into(),
                detail: "omit the field instead of passing an empty string".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[source]
path = "/var/repos/upstream"
branch = "master"
roots = ["lib/project/", "include/project/"]

[destination]
path = "/var/repos/mirror"
branch = "main"

[sync]
skip_source_commits = ["deadbeef"]
patches_directory = "/tmp/patches"
stats_file = "/tmp/stats.json"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: BaseConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.source.path, PathBuf::from("/var/repos/upstream"));
        assert_eq!(config.source.roots.len(), 2);
        assert_eq!(config.destination.branch, "main");
        assert_eq!(config.sync.skip_source_commits, vec!["deadbeef"]);
        assert!(config.sync.first_commit.is_none());
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[source]
path = "/src"
[destination]
path = "/dst"
"#;
        let config: BaseConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.source.branch, "master");
        assert!(config.source.roots.is_empty());
        assert!(config.sync.stats_file.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = BaseConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.destination.path, PathBuf::from("/var/repos/mirror"));
    }

    #[test]
    fn test_file_not_found() {
        let result = BaseConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_first_commit() {
        let mut config: BaseConfig = toml::from_str(sample_toml()).unwrap();
        config.sync.first_commit = Some(String::new());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "sync.first_commit"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_branch() {
        let mut config: BaseConfig = toml::from_str(sample_toml()).unwrap();
        config.source.branch = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "source.branch"
        ));
    }
}
