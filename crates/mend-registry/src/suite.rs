//! Rule test suites
//!
//! Test source for a module is a TOML document with a fixed reference time
//! and a list of cases:
//!
//! ```toml
//! reference_time = "2025-01-06T09:00:00Z"
//!
//! [[case]]
//! name = "tomorrow"
//! input = "tomorrow"
//! expect = "2025-01-07T09:00:00Z"
//!
//! [[case]]
//! input = "random text"   # no `expect`: must not match
//! ```

use crate::error::SuiteError;
use crate::plugin::{call_guarded, CallResult, TimeParserPlugin};
use chrono::{DateTime, Utc};
use mend_core::ClusterId;
use serde::Deserialize;
use std::fmt::Write as _;

/// A parsed test suite
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSuite {
    pub reference_time: DateTime<Utc>,
    #[serde(default, rename = "case")]
    pub cases: Vec<SuiteCase>,
}

/// One expectation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteCase {
    #[serde(default)]
    pub name: Option<String>,
    pub input: String,
    /// Expected instant; `None` means the module must decline the input
    #[serde(default)]
    pub expect: Option<DateTime<Utc>>,
}

/// Outcome of one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    /// Why the case failed
    pub detail: Option<String>,
}

impl RuleSuite {
    /// Parse suite source
    ///
    /// # Errors
    /// - `SuiteError::Syntax` for malformed TOML or unknown keys
    /// - `SuiteError::Empty` when the suite defines no cases
    pub fn parse(cluster_id: &ClusterId, source: &str) -> Result<Self, SuiteError> {
        let suite: Self = toml::from_str(source).map_err(|e| SuiteError::Syntax {
            cluster_id: cluster_id.clone(),
            message: e.message().to_string(),
        })?;
        if suite.cases.is_empty() {
            return Err(SuiteError::Empty(cluster_id.clone()));
        }
        Ok(suite)
    }

    /// Run every case against `plugin` at the suite's reference time
    #[must_use]
    pub fn run(&self, plugin: &dyn TimeParserPlugin) -> Vec<CaseResult> {
        self.cases
            .iter()
            .enumerate()
            .map(|(n, case)| {
                let name = case
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("case_{}", n + 1));
                let detail = check(case, call_guarded(plugin, &case.input, self.reference_time));
                CaseResult {
                    name,
                    passed: detail.is_none(),
                    detail,
                }
            })
            .collect()
    }
}

fn check(case: &SuiteCase, result: CallResult) -> Option<String> {
    match (result, case.expect) {
        (CallResult::Matched(got), Some(want)) if got == want => None,
        (CallResult::Declined, None) => None,
        (CallResult::Matched(got), Some(want)) => Some(format!(
            "{:?}: expected {}, got {}",
            case.input,
            want.to_rfc3339(),
            got.to_rfc3339()
        )),
        (CallResult::Matched(got), None) => Some(format!(
            "{:?}: expected no match, got {}",
            case.input,
            got.to_rfc3339()
        )),
        (CallResult::Declined, Some(want)) => Some(format!(
            "{:?}: expected {}, got no match",
            case.input,
            want.to_rfc3339()
        )),
        (CallResult::Failed(e), _) => Some(format!("{:?}: plugin error: {e}", case.input)),
        (CallResult::Panicked(msg), _) => Some(format!("{:?}: panicked: {msg}", case.input)),
    }
}

/// Render results the way a test runner log reads
///
/// One `PASSED`/`FAILED` line per case, failure details, then a summary
/// line such as `2 passed, 1 failed`.
#[must_use]
pub fn render_report(cluster_id: &ClusterId, results: &[CaseResult]) -> String {
    let mut out = String::new();
    for result in results {
        let status = if result.passed { "PASSED" } else { "FAILED" };
        let _ = writeln!(out, "test_{cluster_id}::{} {status}", result.name);
    }

    let failures: Vec<_> = results.iter().filter(|r| !r.passed).collect();
    if !failures.is_empty() {
        let _ = writeln!(out, "\n=== FAILURES ===");
        for result in &failures {
            let detail = result.detail.as_deref().unwrap_or("failed");
            let _ = writeln!(out, "test_{cluster_id}::{}: {detail}", result.name);
        }
    }

    let passed = results.len() - failures.len();
    let _ = write!(out, "{passed} passed, {} failed", failures.len());
    out
}
