//! Represents the root configuration for a test run.
//!
//! This struct is deserialized with `utils::read_toml_from_file` and contains:
//! - `build`: whether firmware images are built before flashing.
//! - `jobs`: how many targets are driven concurrently.
//! - `report` / `markdown`: optional report outputs.
//! - `defaults`: shell and timing defaults shared by every target.
//! - `targets`: the boards under test.
//! - `tests`: the test cases, in execution order.
//!
//! # Example
//!
//! ```no_run
//! use boardtestor::config::RunConfig;
//!
//! match RunConfig::from_file("runner.toml") {
//!     Ok(config) => println!("{} targets", config.targets.len()),
//!     Err(err) => eprintln!("Failed to load config: {err:#}"),
//! }
//! ```

use anyhow::{Result, bail};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::cli_args::CliArgs;
use crate::config::executor_config::ExecutorConfig;
use crate::config::target_config::TargetConfig;
use crate::config::test_config::TestConfig;
use crate::utils;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default)]
    pub build: bool,
    pub jobs: Option<usize>,
    pub report: Option<PathBuf>,
    pub markdown: Option<PathBuf>,
    #[serde(default)]
    pub defaults: ExecutorConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub tests: Vec<TestConfig>,
}

impl RunConfig {
    /// Reads, validates and resolves a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = utils::read_toml_from_file(path.as_ref())?;
        config.resolved()
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.resolved()
    }

    fn resolved(mut self) -> Result<Self> {
        self.validate()?;
        self.apply_defaults();
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                bail!("Target with empty name in configuration");
            }
            if !names.insert(target.name.as_str()) {
                bail!("Duplicate target name: {}", target.name);
            }
        }
        let mut tests = HashSet::new();
        for test in &self.tests {
            if !tests.insert(test.name.as_str()) {
                bail!("Duplicate test name: {}", test.name);
            }
        }
        if self.jobs == Some(0) {
            bail!("`jobs` must be at least 1");
        }
        Ok(())
    }

    /// Resolves run-wide defaults into every target so targets are
    /// self-contained afterwards.
    fn apply_defaults(&mut self) {
        self.defaults = self.defaults.merged(&ExecutorConfig::default());
        for target in &mut self.targets {
            target.executor = target.executor.merged(&self.defaults);
            debug!("Resolved target {}: {:?}", target.name, target.executor);
        }
    }

    /// Narrows and overrides the configuration from command line flags.
    pub fn apply_cli(&mut self, args: &CliArgs) -> Result<()> {
        if !args.target.is_empty() {
            for name in &args.target {
                if !self.targets.iter().any(|t| &t.name == name) {
                    bail!("Unknown target: {name}");
                }
            }
            self.targets.retain(|t| args.target.contains(&t.name));
        }
        if !args.test.is_empty() {
            for name in &args.test {
                if !self.tests.iter().any(|t| &t.name == name) {
                    bail!("Unknown test: {name}");
                }
            }
            self.tests.retain(|t| args.test.contains(&t.name));
        }
        for target in &mut self.targets {
            if let Some(port) = &args.serial {
                target.serial.port = port.clone();
            }
            if let Some(baud_rate) = args.baudrate {
                target.serial.baud_rate = baud_rate;
            }
            if args.no_flash {
                target.skip_flash = true;
            }
        }
        if args.build {
            self.build = true;
        }
        if let Some(jobs) = args.jobs {
            if jobs == 0 {
                bail!("--jobs must be at least 1");
            }
            self.jobs = Some(jobs);
        }
        if args.output.is_some() {
            self.report = args.output.clone();
        }
        if args.markdown.is_some() {
            self.markdown = args.markdown.clone();
        }
        if args.serial.is_some() && self.targets.len() > 1 && self.jobs != Some(1) {
            warn!(
                "All {} targets share serial port {}; running them one at a time",
                self.targets.len(),
                self.targets[0].port()
            );
            self.jobs = Some(1);
        }
        Ok(())
    }

    /// Number of concurrent target pipelines.
    pub fn jobs(&self) -> usize {
        self.jobs.unwrap_or(self.targets.len()).max(1)
    }
}
