//! Test harness protocol.
//!
//! A test case is a [`Harness`]: given a [`Dut`] bound to a live session it
//! talks to the shell and asserts on command output. The first failing
//! assertion ends the harness with [`HarnessError::Mismatch`]; a harness may
//! also bow out with [`HarnessError::Skip`] when a precondition is missing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use log::debug;
use thiserror::Error;

use crate::config::executor_config::ExecutorConfig;
use crate::config::target_config::TargetConfig;
use crate::config::test_config::TestConfig;
use crate::matcher::{MatchMode, MatchOutcome, match_with_mode};
use crate::session::{Session, SessionError};

mod busybox;
mod psh;
mod scripted;

pub use busybox::BusyboxRuntest;
pub use psh::CatShells;
pub use scripted::{ScriptedHarness, ScriptedStep};

/// A failed output assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionFailure {
    pub message: Option<String>,
    pub command: String,
    pub expected: String,
    pub actual: String,
    pub diff: String,
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            writeln!(f, "{message}")?;
        }
        writeln!(f, "command:  {}", self.command)?;
        writeln!(f, "expected: {:?}", self.expected)?;
        writeln!(f, "actual:   {:?}", self.actual)?;
        write!(f, "{}", self.diff)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("assertion failed: {0}")]
    Mismatch(AssertionFailure),
    #[error("skipped: {0}")]
    Skip(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HarnessError {
    pub fn skip(reason: impl Into<String>) -> Self {
        HarnessError::Skip(reason.into())
    }
}

pub type HarnessResult = Result<(), HarnessError>;

/// Executable behaviour of one test case.
pub trait Harness: Send + Sync {
    fn run(&self, dut: &mut Dut<'_>) -> HarnessResult;
}

/// Device proxy handed to a harness: the session plus the target it belongs
/// to, with the test's deadline applied to every command.
pub struct Dut<'a> {
    session: &'a mut Session,
    target: &'a TargetConfig,
    command_timeout: Duration,
    deadline: Instant,
}

impl<'a> Dut<'a> {
    pub fn new(
        session: &'a mut Session,
        target: &'a TargetConfig,
        command_timeout: Duration,
        test_timeout: Duration,
    ) -> Self {
        Self {
            session,
            target,
            command_timeout,
            deadline: Instant::now() + test_timeout,
        }
    }

    pub fn target(&self) -> &TargetConfig {
        self.target
    }

    /// Handshake: an empty line must bring the prompt back.
    pub fn init(&mut self) -> HarnessResult {
        self.run("")?;
        Ok(())
    }

    /// Time left before the test deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Runs `command` and returns its captured output.
    pub fn run(&mut self, command: &str) -> Result<String, HarnessError> {
        self.run_with_timeout(command, self.command_timeout)
    }

    /// Like [`Dut::run`] with an explicit per-command limit; the test deadline
    /// still caps it.
    pub fn run_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String, HarnessError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(SessionError::Timeout {
                command: command.to_string(),
                timeout: Duration::ZERO,
                partial: String::new(),
            }
            .into());
        }
        Ok(self.session.send_command(command, timeout.min(remaining))?)
    }

    /// Runs `command` and requires its whole output to match `expected`.
    pub fn assert_cmd(
        &mut self,
        command: &str,
        expected: &str,
        message: Option<&str>,
        is_regex: bool,
    ) -> HarnessResult {
        let actual = self.run(command)?;
        check_output(command, &actual, expected, message, is_regex, MatchMode::Full)
    }

    /// Runs `command` and requires `expected` to occur somewhere in its output.
    pub fn assert_cmd_contains(
        &mut self,
        command: &str,
        expected: &str,
        message: Option<&str>,
        is_regex: bool,
    ) -> HarnessResult {
        let actual = self.run(command)?;
        check_output(command, &actual, expected, message, is_regex, MatchMode::Search)
    }
}

/// Matches already-captured output, producing a diagnostic on failure.
pub fn check_output(
    command: &str,
    actual: &str,
    expected: &str,
    message: Option<&str>,
    is_regex: bool,
    mode: MatchMode,
) -> HarnessResult {
    match match_with_mode(actual, expected, is_regex, mode) {
        MatchOutcome::Matched => {
            debug!("`{command}` matched {expected:?}");
            Ok(())
        }
        MatchOutcome::Mismatch(mismatch) => Err(HarnessError::Mismatch(AssertionFailure {
            message: message.map(str::to_string),
            command: command.to_string(),
            expected: mismatch.expected.clone(),
            actual: mismatch.actual.clone(),
            diff: match mismatch.error {
                Some(_) => mismatch.to_string(),
                None => mismatch.diff(),
            },
        })),
    }
}

/// Which targets a test case runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applicability {
    only: Option<HashSet<String>>,
    except: HashSet<String>,
}

impl Applicability {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            only: Some(targets.into_iter().map(Into::into).collect()),
            except: HashSet::new(),
        }
    }

    pub fn except<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except.extend(targets.into_iter().map(Into::into));
        self
    }

    pub fn applies_to(&self, target: &str) -> bool {
        if self.except.contains(target) {
            return false;
        }
        self.only.as_ref().is_none_or(|only| only.contains(target))
    }
}

/// A unit of verification, shared read-only across pipelines.
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub harness: Arc<dyn Harness>,
    pub applicability: Applicability,
    pub timeout: Duration,
    /// Overrides the target's per-command timeout
    pub command_timeout: Option<Duration>,
}

impl TestCase {
    pub fn new(name: &str, harness: Arc<dyn Harness>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            harness,
            applicability: Applicability::all(),
            timeout,
            command_timeout: None,
        }
    }

    pub fn with_applicability(mut self, applicability: Applicability) -> Self {
        self.applicability = applicability;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn applies_to(&self, target: &TargetConfig) -> bool {
        self.applicability.applies_to(&target.name)
    }

    /// Per-command limit for this case on `target`.
    pub fn command_timeout_for(&self, target: &TargetConfig) -> Duration {
        self.command_timeout
            .unwrap_or_else(|| target.executor.command_timeout())
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("applicability", &self.applicability)
            .field("timeout", &self.timeout)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

/// Harness implementations by name.
#[derive(Default, Clone)]
pub struct HarnessRegistry {
    harnesses: HashMap<String, Arc<dyn Harness>>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in harnesses.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("psh/cat-shells", Arc::new(CatShells));
        registry.register("busybox/runtest", Arc::new(BusyboxRuntest));
        registry
    }

    pub fn register(&mut self, name: &str, harness: Arc<dyn Harness>) {
        self.harnesses.insert(name.to_string(), harness);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Harness>> {
        self.harnesses.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.harnesses.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Turns configured tests into runnable test cases, in configuration order.
    pub fn test_cases(&self, tests: &[TestConfig], defaults: &ExecutorConfig) -> Result<Vec<TestCase>> {
        tests
            .iter()
            .map(|test| {
                let harness: Arc<dyn Harness> = if test.is_scripted() {
                    Arc::new(ScriptedHarness::from_config(test))
                } else {
                    match self.get(test.harness_name()) {
                        Some(harness) => harness,
                        None => bail!(
                            "Test {} refers to unknown harness {} (known: {})",
                            test.name,
                            test.harness_name(),
                            self.names().join(", ")
                        ),
                    }
                };
                let applicability = match &test.targets {
                    Some(targets) => Applicability::only(targets.iter().cloned()),
                    None => Applicability::all(),
                }
                .except(test.ignore_targets.iter().cloned());
                Ok(TestCase {
                    name: test.name.clone(),
                    harness,
                    applicability,
                    timeout: test.timeout.unwrap_or_else(|| defaults.test_timeout()),
                    command_timeout: test.command_timeout,
                })
            })
            .collect()
    }
}
