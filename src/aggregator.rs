//! 结果汇总模块
//!
//! Collects one [`TestResult`] per (target, test case) pair in arrival order
//! and keeps running totals. The final [`RunSummary`] decides the exit code.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why a case did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Output did not match
    Assertion,
    /// Timeout, I/O fault, crash, provisioning failure
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub target: String,
    pub test: String,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

impl TestResult {
    pub fn passed(target: &str, test: &str, elapsed: Duration) -> Self {
        Self {
            target: target.to_string(),
            test: test.to_string(),
            status: TestStatus::Passed,
            failure: None,
            message: None,
            elapsed,
        }
    }

    pub fn failed(
        target: &str,
        test: &str,
        kind: FailureKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            target: target.to_string(),
            test: test.to_string(),
            status: TestStatus::Failed,
            failure: Some(kind),
            message: Some(message.into()),
            elapsed,
        }
    }

    pub fn skipped(target: &str, test: &str, reason: impl Into<String>) -> Self {
        Self {
            target: target.to_string(),
            test: test.to_string(),
            status: TestStatus::Skipped,
            failure: None,
            message: Some(reason.into()),
            elapsed: Duration::ZERO,
        }
    }
}

/// Append-only result store with running totals.
#[derive(Debug)]
pub struct Aggregator {
    results: Vec<TestResult>,
    passed: usize,
    failed: usize,
    skipped: usize,
    started: DateTime<Local>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            passed: 0,
            failed: 0,
            skipped: 0,
            started: Local::now(),
        }
    }

    pub fn record(&mut self, result: TestResult) {
        match result.status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
        }
        self.results.push(result);
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    /// Whether `target` already has a result for `test`.
    pub fn has_result(&self, target: &str, test: &str) -> bool {
        self.results
            .iter()
            .any(|r| r.target == target && r.test == test)
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total: self.total(),
            passed: self.passed,
            failed: self.failed,
            skipped: self.skipped,
            started: self.started,
            finished: Local::now(),
            results: self.results.clone(),
        }
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub results: Vec<TestResult>,
}

impl RunSummary {
    /// A run succeeds iff nothing failed; skips do not count against it.
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }

    pub fn failures(&self) -> impl Iterator<Item = &TestResult> {
        self.results
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TESTS: {} PASSED: {} FAILED: {} SKIPPED: {}",
            self.total, self.passed, self.failed, self.skipped
        )
    }
}
