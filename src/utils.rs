//! Utility types and helpers shared across the crate.
//!
//! This module provides TOML loading, bounded child-process execution used by
//! the build and flash collaborators, and small text helpers for diagnostics.

use anyhow::{Context, Result, bail};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use std::{
    fs,
    io::Read,
    path::Path,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

/// Output of a finished child process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// 标准输出
    pub stdout: String,
    /// 标准错误
    pub stderr: String,
    /// Exit code, `None` when killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Reads a TOML file into an arbitrary struct.
///
/// # Errors
///
/// Returns an error if the file cannot be read or data parsing fails.
pub fn read_toml_from_file<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("Unable to read config file: {}", path.display()))?;
    match toml::de::from_str(&content) {
        Ok(config) => Ok(config),
        Err(e) => {
            error!("Failed to parse TOML file: {e}");
            Err(e).with_context(|| format!("Invalid TOML in {}", path.display()))
        }
    }
}

/// Runs `command` through `sh -c`, killing it once `timeout` expires.
///
/// stdout and stderr are drained on their own threads so a chatty build
/// cannot fill the pipe and stall.
pub fn run_shell(command: &str, workdir: Option<&Path>, timeout: Duration) -> Result<CommandOutput> {
    debug!("Running `{command}` (timeout {timeout:?})");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn `{command}`"))?;

    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("`{command}` exceeded {timeout:?}, killing it");
            let _ = child.kill();
            let _ = child.wait();
            bail!("`{command}` timed out after {timeout:?}");
        }
        thread::sleep(Duration::from_millis(50));
    };

    let collect = |handle: Option<thread::JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|h| h.join().ok())
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    };
    Ok(CommandOutput {
        stdout: collect(stdout_reader),
        stderr: collect(stderr_reader),
        exit_code: status.code(),
    })
}

/// Substitutes `{key}` placeholders in a command template.
pub fn expand_placeholders(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}

/// Last `max_lines` lines of `text`, for compact diagnostics.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
