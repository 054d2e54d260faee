//! In-process test runner for rule modules
//!
//! Compiles each staged module, runs its suite at the suite's reference
//! time, and reports the way an external runner would. A module that does
//! not compile, or whose suite is missing, malformed or empty, fails.

use crate::collaborators::{
    CollaboratorError, StagedBatch, StagedModule, TestCaseReport, TestReport, TestRunner,
};
use async_trait::async_trait;
use mend_registry::{render_report, CaseResult, ModuleCompiler, RuleModuleCompiler, RuleSuite};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Runs rule test suites without leaving the process
#[derive(Debug, Clone)]
pub struct RuleTestRunner {
    compiler: Arc<dyn ModuleCompiler>,
}

impl RuleTestRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::with_compiler(Arc::new(RuleModuleCompiler))
    }

    #[must_use]
    pub fn with_compiler(compiler: Arc<dyn ModuleCompiler>) -> Self {
        Self { compiler }
    }

    /// Run one module's suite from source text
    #[must_use]
    pub fn run_sources(
        &self,
        module: &StagedModule,
        module_source: &str,
        test_source: &str,
    ) -> Vec<CaseResult> {
        let plugin = match self.compiler.compile(&module.cluster_id, module_source) {
            Ok(plugin) => plugin,
            Err(e) => return vec![setup_failure("compile", e.to_string())],
        };
        let suite = match RuleSuite::parse(&module.cluster_id, test_source) {
            Ok(suite) => suite,
            Err(e) => return vec![setup_failure("collect", e.to_string())],
        };
        suite.run(plugin.as_ref())
    }

    fn run_blocking(&self, batch: &StagedBatch) -> TestReport {
        let mut per_test_results = Vec::new();
        let mut raw_output = String::new();

        for module in &batch.modules {
            let results = match (
                std::fs::read_to_string(&module.module_path),
                std::fs::read_to_string(&module.test_path),
            ) {
                (Ok(module_source), Ok(test_source)) => {
                    self.run_sources(module, &module_source, &test_source)
                }
                (Err(e), _) | (_, Err(e)) => vec![setup_failure("collect", e.to_string())],
            };

            raw_output.push_str(&render_report(&module.cluster_id, &results));
            raw_output.push('\n');
            per_test_results.extend(results.into_iter().map(|r| TestCaseReport {
                cluster_id: module.cluster_id.clone(),
                name: r.name,
                passed: r.passed,
                detail: r.detail,
            }));
        }

        let failed = per_test_results.iter().filter(|r| !r.passed).count();
        let passed = per_test_results.len() - failed;
        let _ = write!(raw_output, "=== {passed} passed, {failed} failed ===");

        TestReport {
            all_passed: failed == 0 && passed > 0,
            per_test_results,
            raw_output,
        }
    }
}

impl Default for RuleTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn setup_failure(stage: &str, message: String) -> CaseResult {
    CaseResult {
        name: stage.to_string(),
        passed: false,
        detail: Some(message),
    }
}

#[async_trait]
impl TestRunner for RuleTestRunner {
    async fn run(&self, batch: &StagedBatch) -> Result<TestReport, CollaboratorError> {
        let runner = self.clone();
        let batch = batch.clone();
        let report = tokio::task::spawn_blocking(move || runner.run_blocking(&batch))
            .await
            .map_err(CollaboratorError::new)?;
        debug!(
            "Rule test run: {} cases, {} failed",
            report.per_test_results.len(),
            report.failed()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mend_core::{BatchId, ClusterId};
    use std::path::Path;

    const MODULE: &str = "[[rule]]\npattern = '^tomorrow$'\noffset = { days = 1 }\n";
    const SUITE: &str = r#"
reference_time = "2025-01-06T09:00:00Z"

[[case]]
input = "tomorrow"
expect = "2025-01-07T09:00:00Z"
"#;

    fn staged(dir: &Path, module: &str, suite: &str) -> StagedBatch {
        let cluster_id = ClusterId::new("relative_dates").unwrap();
        let module_path = dir.join("relative_dates.toml");
        let test_path = dir.join("test_relative_dates.toml");
        std::fs::write(&module_path, module).unwrap();
        std::fs::write(&test_path, suite).unwrap();
        StagedBatch {
            batch_id: BatchId::new(),
            attempt: 1,
            root: dir.to_path_buf(),
            modules: vec![StagedModule {
                cluster_id,
                module_path,
                test_path,
            }],
        }
    }

    #[tokio::test]
    async fn passing_suite() {
        let dir = tempfile::tempdir().unwrap();
        let report = RuleTestRunner::new()
            .run(&staged(dir.path(), MODULE, SUITE))
            .await
            .unwrap();
        assert!(report.all_passed, "{}", report.raw_output);
        assert!(report.raw_output.ends_with("=== 1 passed, 0 failed ==="));
    }

    #[tokio::test]
    async fn empty_suite_fails() {
        let dir = tempfile::tempdir().unwrap();
        let report = RuleTestRunner::new()
            .run(&staged(dir.path(), MODULE, "reference_time = \"2025-01-06T09:00:00Z\""))
            .await
            .unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.per_test_results[0].name, "collect");
    }

    #[tokio::test]
    async fn broken_module_fails() {
        let dir = tempfile::tempdir().unwrap();
        let report = RuleTestRunner::new()
            .run(&staged(dir.path(), "[[rule]]\npattern = '('", SUITE))
            .await
            .unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.per_test_results[0].name, "compile");
    }
}
