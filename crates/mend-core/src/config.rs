//! Pipeline configuration
//!
//! Values only; nothing here touches the filesystem except [`MendConfig::load`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default `MAX_RETRY_ATTEMPTS`
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
/// Default `CLUSTER_BATCH_SIZE`
pub const DEFAULT_CLUSTER_BATCH_SIZE: usize = 5;
/// Default queue length that triggers a workflow run
pub const DEFAULT_ACTIVATION_THRESHOLD: usize = 5;
/// Default bound on one external test run
pub const DEFAULT_VALIDATION_TIMEOUT_SECS: u64 = 120;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MendConfig {
    /// Failed VALIDATE attempts a batch may use before the safety valve trips
    pub max_retry_attempts: u32,
    /// Clusters processed per batch
    pub cluster_batch_size: usize,
    /// Queue length at which a run is due
    pub activation_threshold: usize,
    /// Timeout for one external test run, in seconds
    pub validation_timeout_secs: u64,
    /// Storage locations
    pub paths: PathsConfig,
}

impl MendConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` on malformed TOML or unknown keys
    /// - `ConfigError::InvalidValue` if [`MendConfig::validate`] fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// Same as [`MendConfig::load`], minus I/O.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    /// `ConfigError::InvalidValue` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.cluster_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "cluster_batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.validation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "validation_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_cluster_batch_size(mut self, size: usize) -> Self {
        self.cluster_batch_size = size;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_activation_threshold(mut self, threshold: usize) -> Self {
        self.activation_threshold = threshold;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Put every storage path under `root`
    #[must_use]
    pub fn rooted_at(mut self, root: impl AsRef<Path>) -> Self {
        self.paths = PathsConfig::under(root);
        self
    }

    /// Timeout as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

impl Default for MendConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            cluster_batch_size: DEFAULT_CLUSTER_BATCH_SIZE,
            activation_threshold: DEFAULT_ACTIVATION_THRESHOLD,
            validation_timeout_secs: DEFAULT_VALIDATION_TIMEOUT_SECS,
            paths: PathsConfig::default(),
        }
    }
}

/// Storage locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Failure queue backing store (JSONL)
    pub queue: PathBuf,
    /// Failed-batch ledger (JSONL)
    pub ledger: PathBuf,
    /// Installed plugin modules
    pub plugins: PathBuf,
    /// Per-batch staging area used by VALIDATE
    pub staging: PathBuf,
}

impl PathsConfig {
    /// Default file names under `root`
    #[must_use]
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        Self {
            queue: root.join(defaults.queue),
            ledger: root.join(defaults.ledger),
            plugins: root.join(defaults.plugins),
            staging: root.join(defaults.staging),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            queue: PathBuf::from("failure_queue.jsonl"),
            ledger: PathBuf::from("failed_batches.jsonl"),
            plugins: PathBuf::from("plugins"),
            staging: PathBuf::from("staging"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_constants() {
        let config = MendConfig::new();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.cluster_batch_size, 5);
        assert_eq!(config.activation_threshold, 5);
        assert_eq!(config.validation_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = MendConfig::from_toml_str(
            r#"
            max_retry_attempts = 5

            [paths]
            queue = "/var/lib/mend/queue.jsonl"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.cluster_batch_size, 5);
        assert_eq!(config.paths.queue, PathBuf::from("/var/lib/mend/queue.jsonl"));
        assert_eq!(config.paths.ledger, PathBuf::from("failed_batches.jsonl"));
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            MendConfig::from_toml_str("max_retries = 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_batch_size_rejected() {
        let err = MendConfig::from_toml_str("cluster_batch_size = 0").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "cluster_batch_size",
                ..
            }
        ));
    }

    #[test]
    fn zero_retries_rejected() {
        assert!(MendConfig::from_toml_str("max_retry_attempts = 0").is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mend.toml");
        std::fs::write(&path, "activation_threshold = 12\n").unwrap();
        let config = MendConfig::load(&path).unwrap();
        assert_eq!(config.activation_threshold, 12);

        assert!(matches!(
            MendConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn rooted_paths() {
        let config = MendConfig::new().rooted_at("/srv/mend");
        assert_eq!(config.paths.plugins, PathBuf::from("/srv/mend/plugins"));
    }
}
