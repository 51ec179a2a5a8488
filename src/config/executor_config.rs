//! 执行器配置参数
//!
//! Shell and timing settings. The same structure is used for the run-wide
//! `[defaults]` table and for the per-target `[targets.executor]` table; unset
//! per-target values fall back to the run-wide ones via [`ExecutorConfig::merged`].

use humantime_serde;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_PROMPT: &str = "(psh)% ";
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LINE_DELIMITER: &str = "\n";
/// Ctrl-C, sent before waiting for the prompt on a reconnect.
pub const DEFAULT_INTERRUPT: &str = "\x03";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Shell prompt marker printed when the shell is idle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub command_timeout: Option<Duration>,
    /// 等待系统启动并出现提示符的时间
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub boot_timeout: Option<Duration>,
    /// How long the line may stay silent before a bare line delimiter is sent
    /// to make the shell print its prompt.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub probe_interval: Option<Duration>,
    /// Default per-test deadline when a test does not declare one
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    pub test_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_delimiter: Option<String>,
    /// Whether the shell echoes the command line back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            prompt: Some(DEFAULT_PROMPT.to_string()),
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            boot_timeout: Some(DEFAULT_BOOT_TIMEOUT),
            probe_interval: Some(DEFAULT_PROBE_INTERVAL),
            test_timeout: Some(DEFAULT_TEST_TIMEOUT),
            line_delimiter: Some(DEFAULT_LINE_DELIMITER.to_string()),
            echo: Some(true),
            interrupt: Some(DEFAULT_INTERRUPT.to_string()),
        }
    }
}

impl ExecutorConfig {
    /// A configuration with every field unset.
    pub fn unset() -> Self {
        Self {
            prompt: None,
            command_timeout: None,
            boot_timeout: None,
            probe_interval: None,
            test_timeout: None,
            line_delimiter: None,
            echo: None,
            interrupt: None,
        }
    }

    /// Fills every unset field from `fallback`.
    pub fn merged(&self, fallback: &ExecutorConfig) -> ExecutorConfig {
        ExecutorConfig {
            prompt: self.prompt.clone().or_else(|| fallback.prompt.clone()),
            command_timeout: self.command_timeout.or(fallback.command_timeout),
            boot_timeout: self.boot_timeout.or(fallback.boot_timeout),
            probe_interval: self.probe_interval.or(fallback.probe_interval),
            test_timeout: self.test_timeout.or(fallback.test_timeout),
            line_delimiter: self
                .line_delimiter
                .clone()
                .or_else(|| fallback.line_delimiter.clone()),
            echo: self.echo.or(fallback.echo),
            interrupt: self.interrupt.clone().or_else(|| fallback.interrupt.clone()),
        }
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_PROMPT)
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn boot_timeout(&self) -> Duration {
        self.boot_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT)
    }

    pub fn probe_interval(&self) -> Duration {
        self.probe_interval.unwrap_or(DEFAULT_PROBE_INTERVAL)
    }

    pub fn test_timeout(&self) -> Duration {
        self.test_timeout.unwrap_or(DEFAULT_TEST_TIMEOUT)
    }

    pub fn line_delimiter(&self) -> &str {
        self.line_delimiter.as_deref().unwrap_or(DEFAULT_LINE_DELIMITER)
    }

    pub fn echo(&self) -> bool {
        self.echo.unwrap_or(true)
    }

    /// An empty interrupt string disables the interrupt on reconnect.
    pub fn interrupt(&self) -> Option<&str> {
        match self.interrupt.as_deref() {
            Some("") => None,
            Some(seq) => Some(seq),
            None => Some(DEFAULT_INTERRUPT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_prefers_own_values() {
        let own = ExecutorConfig {
            prompt: Some("# ".to_string()),
            boot_timeout: Some(Duration::from_secs(5)),
            ..ExecutorConfig::unset()
        };
        let merged = own.merged(&ExecutorConfig::default());
        assert_eq!(merged.prompt(), "# ");
        assert_eq!(merged.boot_timeout(), Duration::from_secs(5));
        assert_eq!(merged.command_timeout(), DEFAULT_COMMAND_TIMEOUT);
        assert!(merged.echo());
    }

    #[test]
    fn empty_interrupt_disables_it() {
        let config = ExecutorConfig {
            interrupt: Some(String::new()),
            ..ExecutorConfig::default()
        };
        assert_eq!(config.interrupt(), None);
        assert_eq!(ExecutorConfig::unset().interrupt(), Some("\x03"));
    }
}
