//! Plugin directory
//!
//! Layout under the store root:
//! - `<cluster_id>.toml`: module source
//! - `tests/test_<cluster_id>.toml`: its test suite
//!
//! The store only reads and writes files. Loading and validation belong to
//! [`PluginRegistry`](crate::PluginRegistry).

use crate::error::StoreError;
use crate::generation::{truncate, SUMMARY_DESCRIPTION_LIMIT};
use mend_core::{ClusterId, CodeArtifact, ModuleSummary};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `None` only if the pattern fails to compile, which disables pruning
static TEST_FILE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^test_([a-z0-9_]+)\.toml$").ok());

const TESTS_DIR: &str = "tests";

/// Installed plugin modules on disk
#[derive(Debug, Clone)]
pub struct PluginStore {
    root: PathBuf,
}

impl PluginStore {
    /// Open the store, creating its directories if needed
    ///
    /// # Errors
    /// `StoreError::Io` if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let tests = root.join(TESTS_DIR);
        fs::create_dir_all(&tests).map_err(StoreError::io(&tests))?;
        Ok(Self { root })
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn module_path(&self, cluster_id: &ClusterId) -> PathBuf {
        self.root.join(format!("{cluster_id}.toml"))
    }

    #[must_use]
    pub fn test_path(&self, cluster_id: &ClusterId) -> PathBuf {
        self.root
            .join(TESTS_DIR)
            .join(format!("test_{cluster_id}.toml"))
    }

    /// Installed module ids, ascending
    ///
    /// Files whose stem is not a valid cluster id are skipped with a warning.
    ///
    /// # Errors
    /// `StoreError::Io` if the directory cannot be listed.
    pub fn module_ids(&self) -> Result<Vec<ClusterId>, StoreError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(StoreError::io(&self.root))? {
            let path = entry.map_err(StoreError::io(&self.root))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match ClusterId::new(stem) {
                Ok(id) => ids.push(id),
                Err(e) => warn!("Ignoring plugin file {}: {}", path.display(), e),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Candidate artifacts for every installed module; nothing is loaded
    ///
    /// A module without a test suite gets an empty `test_source`.
    ///
    /// # Errors
    /// `StoreError::Io` if a file cannot be read.
    pub fn discover(&self) -> Result<Vec<CodeArtifact>, StoreError> {
        let mut artifacts = Vec::new();
        for id in self.module_ids()? {
            let module_path = self.module_path(&id);
            let module_source =
                fs::read_to_string(&module_path).map_err(StoreError::io(&module_path))?;
            let test_path = self.test_path(&id);
            let test_source = match fs::read_to_string(&test_path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(StoreError::io(&test_path)(e)),
            };
            artifacts.push(CodeArtifact::new(id, module_source, test_source));
        }
        debug!("Discovered {} plugin modules in {}", artifacts.len(), self.root.display());
        Ok(artifacts)
    }

    /// Write module and test files for `artifacts`, each by atomic rename
    ///
    /// # Errors
    /// `StoreError::Io` on the first file that cannot be written.
    pub fn persist(&self, artifacts: &[CodeArtifact]) -> Result<(), StoreError> {
        for artifact in artifacts {
            write_atomic(&self.module_path(&artifact.cluster_id), &artifact.module_source)?;
            write_atomic(&self.test_path(&artifact.cluster_id), &artifact.test_source)?;
        }
        info!("Persisted {} plugin modules", artifacts.len());
        Ok(())
    }

    /// Delete test suites whose module no longer exists
    ///
    /// Returns the removed paths.
    ///
    /// # Errors
    /// `StoreError::Io` if the tests directory cannot be listed or a file
    /// cannot be removed.
    pub fn prune_orphan_tests(&self) -> Result<Vec<PathBuf>, StoreError> {
        let Some(pattern) = TEST_FILE.as_ref() else {
            warn!("Test file pattern unavailable; skipping prune");
            return Ok(Vec::new());
        };
        let tests = self.root.join(TESTS_DIR);
        let modules = self.module_ids()?;
        let mut removed = Vec::new();

        for entry in fs::read_dir(&tests).map_err(StoreError::io(&tests))? {
            let path = entry.map_err(StoreError::io(&tests))?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(id) = pattern
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| ClusterId::new(m.as_str()).ok())
            else {
                continue;
            };
            if !modules.contains(&id) {
                fs::remove_file(&path).map_err(StoreError::io(&path))?;
                info!("Removed orphaned test suite {}", path.display());
                removed.push(path);
            }
        }
        Ok(removed)
    }

    /// Id and description of each installed module, description truncated
    ///
    /// Modules whose source cannot be read as TOML get an empty description.
    ///
    /// # Errors
    /// `StoreError::Io` if a module file cannot be read.
    pub fn summaries(&self) -> Result<Vec<ModuleSummary>, StoreError> {
        let mut out = Vec::new();
        for id in self.module_ids()? {
            let path = self.module_path(&id);
            let source = fs::read_to_string(&path).map_err(StoreError::io(&path))?;
            let description = source
                .parse::<toml::Table>()
                .ok()
                .and_then(|t| t.get("description").and_then(|d| d.as_str().map(str::to_owned)))
                .unwrap_or_default();
            out.push(ModuleSummary {
                cluster_id: id,
                description: truncate(&description, SUMMARY_DESCRIPTION_LIMIT),
            });
        }
        Ok(out)
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(StoreError::io(dir))?;
    tmp.write_all(contents.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(StoreError::io(path))?;
    tmp.persist(path).map_err(|e| StoreError::io(path)(e.error))?;
    Ok(())
}
