//! BusyBox test suite runner.
//!
//! The on-target `test_busybox` helper starts posixsrv, runs
//! `/bin/testsuite/runtest` and prints `Runtest done` when it finishes. Images
//! built without the long test suite report that instead; that is a skip.

use log::info;

use crate::harness::{AssertionFailure, Dut, Harness, HarnessError, HarnessResult};

pub const RUNTEST_COMMAND: &str = "test_busybox";
const DONE_MARKER: &str = "Runtest done";
const MISSING_SUITE: &str = "There is no busybox test suite to run";

#[derive(Debug, Default, Clone, Copy)]
pub struct BusyboxRuntest;

impl Harness for BusyboxRuntest {
    fn run(&self, dut: &mut Dut<'_>) -> HarnessResult {
        dut.init()?;
        // The whole suite is one command; only the test deadline bounds it.
        let output = dut.run_with_timeout(RUNTEST_COMMAND, dut.remaining())?;
        if output.contains(MISSING_SUITE) {
            return Err(HarnessError::skip(
                "busybox test suite not installed, build the project with \"long_test\"",
            ));
        }

        let failed: Vec<&str> = output
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| line.starts_with("FAIL:"))
            .collect();
        let passed = output.lines().filter(|line| line.starts_with("PASS:")).count();
        info!("busybox runtest on {}: {passed} passed, {} failed", dut.target().name, failed.len());

        if !failed.is_empty() || !output.contains(DONE_MARKER) {
            let message = if failed.is_empty() {
                "busybox runtest did not complete".to_string()
            } else {
                format!("{} busybox test(s) failed", failed.len())
            };
            return Err(HarnessError::Mismatch(AssertionFailure {
                message: Some(message),
                command: RUNTEST_COMMAND.to_string(),
                expected: format!("no FAIL: lines and a final `{DONE_MARKER}`"),
                actual: crate::utils::tail_lines(&output, 20),
                diff: failed.join("\n"),
            }));
        }
        Ok(())
    }
}
