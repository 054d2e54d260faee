//! Testing utilities for the mend workspace
//!
//! Shared rule-module fixtures, an isolated storage environment, and
//! scripted collaborators.

#![allow(missing_docs)]

use async_trait::async_trait;
use mend_core::{
    ClusterId, CodeArtifact, ErrorCluster, FailureRecord, MendConfig, NewFailure, Parsability,
};
use mend_queue::FailureQueue;
use mend_workflow::{
    ClusterAnalyzer, ClusterPlan, CodeGenerator, CollaboratorError, PlanRequest, StagedBatch,
    Stores, TestReport, TestRunner,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub mod fixtures {
    //! Rule modules and suites for a `relative_dates` cluster

    /// Cluster every fixture targets
    pub const CLUSTER: &str = "relative_dates";

    /// Queue inputs the working module handles
    pub const INPUTS: [&str; 5] = [
        "tomorrow",
        "in 3 days",
        "day after tomorrow",
        "Tomorrow!",
        "in 2 weeks",
    ];

    /// Passes [`SUITE`]
    pub const MODULE: &str = r#"
description = "Relative day and week offsets"

[[rule]]
pattern = '^tomorrow$'
offset = { days = 1 }

[[rule]]
pattern = '^(the )?day after tomorrow$'
offset = { days = 2 }

[[rule]]
pattern = '^in (?P<amount>\d+) (?P<unit>minute|hour|day|week)s?$'
"#;

    /// Compiles, but has no rule for "day after tomorrow": fails one case
    pub const BROKEN_MODULE: &str = r#"
description = "Relative day and week offsets"

[[rule]]
pattern = '^tomorrow$'
offset = { days = 1 }

[[rule]]
pattern = '^in (?P<amount>\d+) (?P<unit>minute|hour|day|week)s?$'
"#;

    /// Not a rule module at all
    pub const GARBAGE_MODULE: &str = "def parse(text): return None";

    pub const SUITE: &str = r#"
reference_time = "2025-01-06T09:00:00Z"

[[case]]
name = "tomorrow"
input = "tomorrow"
expect = "2025-01-07T09:00:00Z"

[[case]]
name = "day_after_tomorrow"
input = "day after tomorrow"
expect = "2025-01-08T09:00:00Z"

[[case]]
name = "in_days"
input = "in 3 days"
expect = "2025-01-09T09:00:00Z"

[[case]]
name = "unrelated"
input = "random text"
"#;
}

pub fn cluster_id() -> ClusterId {
    ClusterId::new(fixtures::CLUSTER).unwrap()
}

/// Temporary directory with every storage path rooted in it
#[derive(Debug)]
pub struct TestEnv {
    dir: TempDir,
    pub config: MendConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = MendConfig::new().rooted_at(dir.path());
        Self { dir, config }
    }

    pub fn with_config(mut self, f: impl FnOnce(MendConfig) -> MendConfig) -> Self {
        self.config = f(self.config);
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn open_stores(&self) -> Stores {
        Stores::open(&self.config).unwrap()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one failure per input
pub fn seed_queue(queue: &FailureQueue, inputs: &[&str]) -> Vec<FailureRecord> {
    inputs
        .iter()
        .map(|input| queue.append(NewFailure::new(*input)).unwrap())
        .collect()
}

/// Puts every record in one `parsable` cluster
#[derive(Debug, Clone)]
pub struct SingleClusterAnalyzer {
    pub cluster_id: ClusterId,
}

impl SingleClusterAnalyzer {
    pub fn new() -> Self {
        Self {
            cluster_id: cluster_id(),
        }
    }
}

impl Default for SingleClusterAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterAnalyzer for SingleClusterAnalyzer {
    async fn cluster(&self, records: &[FailureRecord]) -> Result<Vec<ErrorCluster>, CollaboratorError> {
        Ok(vec![ErrorCluster::new(
            self.cluster_id.clone(),
            records.iter().map(|r| r.sequence_index),
            Parsability::Parsable,
        )
        .with_commonality("relative day offsets")])
    }
}

/// What the generator does on one attempt
#[derive(Debug, Clone)]
pub enum Script {
    /// Plan every cluster, then produce these sources for each
    Sources { module: String, tests: String },
    /// `plan` fails
    PlanError(String),
    /// `plan` returns nothing
    EmptyPlan,
    /// `generate` leaves every cluster out
    NoArtifacts,
}

impl Script {
    pub fn sources(module: &str, tests: &str) -> Self {
        Self::Sources {
            module: module.to_string(),
            tests: tests.to_string(),
        }
    }
}

/// Code generator following a per-attempt script
///
/// Attempt `n` uses script `n`; the last script repeats. Every
/// [`PlanRequest`] is kept for inspection.
#[derive(Debug)]
pub struct ScriptedGenerator {
    scripts: Vec<Script>,
    current: Mutex<Option<Script>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Script>) -> Self {
        assert!(!scripts.is_empty(), "at least one script");
        Self {
            scripts,
            current: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Same sources every attempt
    pub fn always(module: &str, tests: &str) -> Self {
        Self::new(vec![Script::sources(module, tests)])
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().clone()
    }

    fn script_for(&self, attempt: u32) -> Script {
        let n = (attempt as usize).saturating_sub(1).min(self.scripts.len() - 1);
        self.scripts[n].clone()
    }
}

#[async_trait]
impl CodeGenerator for ScriptedGenerator {
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<ClusterPlan>, CollaboratorError> {
        self.requests.lock().push(request.clone());
        let script = self.script_for(request.attempt);
        *self.current.lock() = Some(script.clone());
        match script {
            Script::PlanError(message) => Err(CollaboratorError::new(message)),
            Script::EmptyPlan => Ok(Vec::new()),
            Script::Sources { .. } | Script::NoArtifacts => Ok(request
                .clusters
                .iter()
                .map(|c| ClusterPlan::new(c.cluster_id.clone(), "scripted"))
                .collect()),
        }
    }

    async fn generate(
        &self,
        plans: &[ClusterPlan],
    ) -> Result<BTreeMap<ClusterId, CodeArtifact>, CollaboratorError> {
        let script = self.current.lock().clone();
        match script {
            Some(Script::Sources { module, tests }) => Ok(plans
                .iter()
                .map(|p| {
                    (
                        p.cluster_id.clone(),
                        CodeArtifact::new(p.cluster_id.clone(), module.clone(), tests.clone()),
                    )
                })
                .collect()),
            Some(_) => Ok(BTreeMap::new()),
            None => Err(CollaboratorError::new("generate called before plan")),
        }
    }
}

/// Test runner that takes `delay` and then reports success
#[derive(Debug, Clone)]
pub struct StallingRunner {
    pub delay: Duration,
}

#[async_trait]
impl TestRunner for StallingRunner {
    async fn run(&self, _batch: &StagedBatch) -> Result<TestReport, CollaboratorError> {
        tokio::time::sleep(self.delay).await;
        Ok(TestReport {
            all_passed: true,
            per_test_results: Vec::new(),
            raw_output: "1 passed, 0 failed".to_string(),
        })
    }
}
