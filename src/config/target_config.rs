//! Represents the configuration for each target board.
//!
//! A target is one board (or emulator) with its own serial endpoint. It is
//! read once at startup and shared read-only between pipelines afterwards.

use crate::config::executor_config::ExecutorConfig;
use crate::config::serial_config::SerialConfig;
use humantime_serde;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_build_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_flash_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_flash_attempts() -> u32 {
    3
}

fn default_flash_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_attempts() -> u32 {
    1
}

fn default_reconnect_backoff() -> Duration {
    Duration::from_secs(1)
}

/// How the firmware image for a target is produced.
///
/// Without a `command` (or when the run was not asked to build) the image at
/// `image` is assumed to be pre-built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildConfig {
    pub command: Option<String>,
    /// Working directory for `command`; relative image paths resolve against it
    pub workdir: Option<PathBuf>,
    /// Path of the flashable payload
    pub image: Option<PathBuf>,
    #[serde(with = "humantime_serde", default = "default_build_timeout")]
    pub timeout: Duration,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            command: None,
            workdir: None,
            image: None,
            timeout: default_build_timeout(),
        }
    }
}

impl BuildConfig {
    /// Image path resolved against the working directory.
    pub fn image_path(&self) -> Option<PathBuf> {
        let image = self.image.as_ref()?;
        match &self.workdir {
            Some(dir) if image.is_relative() => Some(dir.join(image)),
            _ => Some(image.clone()),
        }
    }
}

/// Flashing and reset commands. `{image}`, `{port}` and `{target}` are
/// substituted before running.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlashConfig {
    pub command: Option<String>,
    pub reset_command: Option<String>,
    /// Output pattern meaning the board is not connected at all (not retried)
    pub absent_pattern: Option<String>,
    #[serde(with = "humantime_serde", default = "default_flash_timeout")]
    pub timeout: Duration,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            command: None,
            reset_command: None,
            absent_pattern: None,
            timeout: default_flash_timeout(),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_flash_attempts")]
    pub flash_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_flash_backoff")]
    pub flash_backoff: Duration,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_reconnect_backoff")]
    pub reconnect_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            flash_attempts: default_flash_attempts(),
            flash_backoff: default_flash_backoff(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff: default_reconnect_backoff(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    /// Unique target name, e.g. `armv7a9-zynq7000-qemu`
    pub name: String,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub flash: FlashConfig,
    /// The board is already flashed and running; go straight to the shell
    #[serde(default)]
    pub skip_flash: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "ExecutorConfig::unset")]
    pub executor: ExecutorConfig,
}

impl TargetConfig {
    /// A target with default settings, mostly useful in tests.
    pub fn new(name: &str, port: &str) -> Self {
        Self {
            name: name.to_string(),
            serial: SerialConfig {
                port: port.to_string(),
                ..SerialConfig::default()
            },
            build: BuildConfig::default(),
            flash: FlashConfig::default(),
            skip_flash: false,
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    pub fn port(&self) -> &str {
        &self.serial.port
    }
}
