//! External collaborators
//!
//! Clustering, code generation and test execution are services the
//! workflow calls but does not implement. Each sits behind a narrow async
//! trait so hosted services, local tools, or test doubles can be plugged in.

use async_trait::async_trait;
use mend_core::{BatchId, ClusterId, CodeArtifact, ErrorCluster, FailureRecord, ModuleSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Error reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CollaboratorError {
    pub message: String,
}

impl CollaboratorError {
    #[must_use]
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Groups failure records into clusters of similar inputs
#[async_trait]
pub trait ClusterAnalyzer: Send + Sync {
    /// # Errors
    /// `CollaboratorError` if the analysis could not be produced.
    async fn cluster(&self, records: &[FailureRecord]) -> Result<Vec<ErrorCluster>, CollaboratorError>;
}

/// Everything the code generator gets to plan one attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRequest {
    pub batch_id: BatchId,
    /// 1-based attempt number within the batch
    pub attempt: u32,
    pub clusters: Vec<ErrorCluster>,
    /// Member records of the selected clusters
    pub records: Vec<FailureRecord>,
    /// Modules already installed, so coverage is not duplicated
    pub existing_modules: Vec<ModuleSummary>,
    /// What went wrong last attempt; `None` on the first
    pub feedback: Option<String>,
}

/// Plan for one cluster, produced by PLAN and consumed by ACT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPlan {
    pub cluster_id: ClusterId,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub test_cases: Vec<String>,
}

impl ClusterPlan {
    #[must_use]
    pub fn new(cluster_id: ClusterId, approach: impl Into<String>) -> Self {
        Self {
            cluster_id,
            approach: approach.into(),
            test_cases: Vec::new(),
        }
    }
}

/// Produces plans and module/test source
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// # Errors
    /// `CollaboratorError` if no plan could be produced.
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<ClusterPlan>, CollaboratorError>;

    /// # Errors
    /// `CollaboratorError` if no code could be produced.
    async fn generate(
        &self,
        plans: &[ClusterPlan],
    ) -> Result<BTreeMap<ClusterId, CodeArtifact>, CollaboratorError>;
}

/// One module and its tests, written to the staging area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedModule {
    pub cluster_id: ClusterId,
    pub module_path: PathBuf,
    pub test_path: PathBuf,
}

/// A batch attempt's artifacts, as files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBatch {
    pub batch_id: BatchId,
    pub attempt: u32,
    pub root: PathBuf,
    pub modules: Vec<StagedModule>,
}

/// Result of one test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseReport {
    pub cluster_id: ClusterId,
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a test run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestReport {
    pub all_passed: bool,
    #[serde(default)]
    pub per_test_results: Vec<TestCaseReport>,
    #[serde(default)]
    pub raw_output: String,
}

impl TestReport {
    /// Number of failed cases
    #[must_use]
    pub fn failed(&self) -> usize {
        self.per_test_results.iter().filter(|r| !r.passed).count()
    }
}

/// Runs a staged batch's tests against its modules
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// # Errors
    /// `CollaboratorError` if the run itself could not be carried out.
    /// Failing tests are reported in the `TestReport`, not as an error.
    async fn run(&self, batch: &StagedBatch) -> Result<TestReport, CollaboratorError>;
}
