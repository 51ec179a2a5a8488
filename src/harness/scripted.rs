//! Harnesses declared in the run configuration as a list of steps.

use crate::config::test_config::TestConfig;
use crate::harness::{Dut, Harness, HarnessResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedStep {
    pub command: String,
    pub expected: Option<String>,
    pub regex: bool,
    pub message: Option<String>,
}

/// Runs its steps in order; each step with an expectation is an assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedHarness {
    pub init: bool,
    pub steps: Vec<ScriptedStep>,
}

impl ScriptedHarness {
    pub fn from_config(test: &TestConfig) -> Self {
        Self {
            init: test.init,
            steps: test
                .steps
                .iter()
                .map(|step| ScriptedStep {
                    command: step.command.clone(),
                    expected: step.expected.clone(),
                    regex: step.regex,
                    message: step.message.clone(),
                })
                .collect(),
        }
    }
}

impl Harness for ScriptedHarness {
    fn run(&self, dut: &mut Dut<'_>) -> HarnessResult {
        if self.init {
            dut.init()?;
        }
        for step in &self.steps {
            match &step.expected {
                Some(expected) => {
                    dut.assert_cmd(&step.command, expected, step.message.as_deref(), step.regex)?
                }
                None => {
                    dut.run(&step.command)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::ShellScript;
    use crate::harness::HarnessError;
    use crate::harness::tests::{PROMPT, run_harness};

    fn step(command: &str, expected: Option<&str>) -> ScriptedStep {
        ScriptedStep {
            command: command.to_string(),
            expected: expected.map(str::to_string),
            regex: false,
            message: None,
        }
    }

    #[test_log::test]
    fn stops_at_first_failing_step() {
        let harness = ScriptedHarness {
            init: true,
            steps: vec![
                step("mkdir /tmp/x", None),
                step("ls /tmp", Some("y\n")),
                step("rm -r /tmp/x", None),
            ],
        };
        let script = ShellScript::new(PROMPT).reply("mkdir /tmp/x", "").reply("ls /tmp", "x\n");
        let err = run_harness(&harness, script).unwrap_err();
        let HarnessError::Mismatch(failure) = err else {
            panic!("expected mismatch");
        };
        assert_eq!(failure.command, "ls /tmp");
        assert_eq!(failure.actual, "x\n");
    }

    #[test_log::test]
    fn passes_all_steps() {
        let harness = ScriptedHarness {
            init: false,
            steps: vec![step("echo a", Some("a\n")), step("echo b", Some("b\n"))],
        };
        let script = ShellScript::new(PROMPT).reply("echo a", "a\n").reply("echo b", "b\n");
        run_harness(&harness, script).unwrap();
    }
}
