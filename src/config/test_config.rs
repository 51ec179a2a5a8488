//! Test case definitions as listed in the run configuration.
//!
//! A test either names a registered harness (`harness = "psh/cat-shells"`) or
//! carries inline `steps`, in which case it becomes a scripted harness.

use humantime_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One "run command, expect output" step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepConfig {
    pub command: String,
    /// Expected output; when absent the command only has to return to the prompt
    pub expected: Option<String>,
    #[serde(default)]
    pub regex: bool,
    /// Extra text for the failure diagnostic
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TestConfig {
    pub name: String,
    /// Registered harness name; defaults to `name` when there are no steps
    pub harness: Option<String>,
    /// Only run on these targets
    pub targets: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_targets: Vec<String>,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    /// Per-command limit for this test, overriding the target's
    #[serde(with = "humantime_serde", default)]
    pub command_timeout: Option<Duration>,
    /// Run the shell handshake before the steps
    #[serde(default = "default_init")]
    pub init: bool,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

fn default_init() -> bool {
    true
}

impl TestConfig {
    pub fn harness_name(&self) -> &str {
        self.harness.as_deref().unwrap_or(&self.name)
    }

    pub fn is_scripted(&self) -> bool {
        !self.steps.is_empty()
    }
}
