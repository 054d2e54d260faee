//! Staging area for VALIDATE
//!
//! `<staging>/<batch_id>/attempt-<n>/{modules,tests}`: each attempt gets a
//! fresh directory so a test run never sees files from an earlier attempt.

use crate::collaborators::{StagedBatch, StagedModule};
use crate::error::WorkflowError;
use mend_core::{BatchId, CodeArtifact};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

fn staging_error(path: &Path) -> impl FnOnce(std::io::Error) -> WorkflowError + '_ {
    move |source| WorkflowError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

/// Directory holding every attempt of one batch
#[must_use]
pub fn batch_dir(staging_root: &Path, batch_id: BatchId) -> PathBuf {
    staging_root.join(batch_id.to_string())
}

/// Write `artifacts` for one attempt
///
/// # Errors
/// `WorkflowError::Staging` if a directory or file cannot be written.
pub async fn stage<'a>(
    staging_root: &Path,
    batch_id: BatchId,
    attempt: u32,
    artifacts: impl IntoIterator<Item = &'a CodeArtifact>,
) -> Result<StagedBatch, WorkflowError> {
    let root = batch_dir(staging_root, batch_id).join(format!("attempt-{attempt}"));
    let modules_dir = root.join("modules");
    let tests_dir = root.join("tests");
    for dir in [&modules_dir, &tests_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(staging_error(dir))?;
    }

    let mut modules = Vec::new();
    for artifact in artifacts {
        let module_path = modules_dir.join(format!("{}.toml", artifact.cluster_id));
        let test_path = tests_dir.join(format!("test_{}.toml", artifact.cluster_id));
        tokio::fs::write(&module_path, &artifact.module_source)
            .await
            .map_err(staging_error(&module_path))?;
        tokio::fs::write(&test_path, &artifact.test_source)
            .await
            .map_err(staging_error(&test_path))?;
        modules.push(StagedModule {
            cluster_id: artifact.cluster_id.clone(),
            module_path,
            test_path,
        });
    }

    debug!("Staged {} modules in {}", modules.len(), root.display());
    Ok(StagedBatch {
        batch_id,
        attempt,
        root,
        modules,
    })
}

/// Remove everything staged for a batch; failures are only logged
pub async fn clean(staging_root: &Path, batch_id: BatchId) {
    let dir = batch_dir(staging_root, batch_id);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => debug!("Removed staging directory {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove staging directory {}: {}", dir.display(), e),
    }
}
