//! Shell session driver.
//!
//! A [`Session`] owns one console [`Transport`] plus the claim on its port and
//! speaks the interactive shell protocol over it: wait for the prompt, send a
//! command line, collect everything up to the next prompt that starts a line,
//! and hand back the text in between without the echoed command or the prompt.
//!
//! Console output arrives in arbitrary fragments, so all framing is done on an
//! internal byte buffer. A prompt only counts when it begins a line (carriage
//! returns in front of it are ignored); prompt text embedded in the middle of
//! output is never treated as completion.

use log::{debug, info, warn};
use std::io;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::executor_config::ExecutorConfig;
use crate::connection::{PortGuard, Transport};
use crate::utils::tail_lines;

/// Longest single blocking read; keeps deadline checks responsive.
const READ_SLICE: Duration = Duration::from_millis(50);
/// Upper bound on reads spent discarding stale output before a command.
const MAX_DRAIN_READS: usize = 64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("serial port {0} is already in use by another session")]
    PortBusy(String),
    #[error("unable to open serial port {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("no shell prompt on {port} within {timeout:?}; last output: {tail:?}")]
    BootTimeout {
        port: String,
        timeout: Duration,
        tail: String,
    },
    #[error("command `{command}` did not return to the prompt within {timeout:?}; partial output: {partial:?}")]
    Timeout {
        command: String,
        timeout: Duration,
        partial: String,
    },
    #[error("session on {0} is closed")]
    Closed(String),
    #[error("session on {0} is unreliable after an earlier fault")]
    Unreliable(String),
    #[error("serial I/O error on {port}: {source}")]
    Io {
        port: String,
        #[source]
        source: io::Error,
    },
}

impl SessionError {
    /// Timeouts are infrastructure faults, never assertion failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout { .. } | SessionError::BootTimeout { .. }
        )
    }
}

/// Shell protocol settings for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub prompt: String,
    pub boot_timeout: Duration,
    pub probe_interval: Duration,
    pub line_delimiter: String,
    pub echo: bool,
    /// Sent before waiting for the prompt on a reconnect
    pub interrupt: Option<String>,
}

impl From<&ExecutorConfig> for SessionOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            prompt: config.prompt().to_string(),
            boot_timeout: config.boot_timeout(),
            probe_interval: config.probe_interval(),
            line_delimiter: config.line_delimiter().to_string(),
            echo: config.echo(),
            interrupt: config.interrupt().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// A command timed out or I/O failed; the shell may be out of sync
    Unreliable,
    Closed,
}

pub struct Session {
    port: String,
    transport: Option<Box<dyn Transport>>,
    guard: Option<PortGuard>,
    buffer: Vec<u8>,
    options: SessionOptions,
    state: SessionState,
    last_prompt: Option<Instant>,
}

impl Session {
    /// Takes over a freshly opened transport and waits for the shell prompt.
    ///
    /// Fails with [`SessionError::BootTimeout`] if no prompt shows up within
    /// `options.boot_timeout`. The port is released on failure.
    pub fn open(
        guard: PortGuard,
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        Self::establish(guard, transport, options, false)
    }

    /// Like [`Session::open`], but first interrupts whatever the shell may
    /// still be running from a previous session.
    pub fn reconnect(
        guard: PortGuard,
        transport: Box<dyn Transport>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        Self::establish(guard, transport, options, true)
    }

    fn establish(
        guard: PortGuard,
        transport: Box<dyn Transport>,
        options: SessionOptions,
        interrupt: bool,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            port: guard.port().to_string(),
            transport: Some(transport),
            guard: Some(guard),
            buffer: Vec::new(),
            options,
            state: SessionState::Open,
            last_prompt: None,
        };
        if interrupt {
            if let Some(seq) = session.options.interrupt.clone() {
                debug!("[{}] Interrupting previous command", session.port);
                session.write(seq.as_bytes())?;
            }
        }
        session.wait_for_prompt()?;
        info!("[{}] Shell is ready", session.port);
        Ok(session)
    }

    fn wait_for_prompt(&mut self) -> Result<(), SessionError> {
        let timeout = self.options.boot_timeout;
        let deadline = Instant::now() + timeout;
        let mut last_activity = Instant::now();
        loop {
            if let Some(at) = find_prompt(&self.buffer, self.options.prompt.as_bytes(), 0) {
                debug!("[{}] Prompt found after {} bytes of output", self.port, at);
                self.buffer.clear();
                self.last_prompt = Some(Instant::now());
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let tail = tail_lines(&String::from_utf8_lossy(&self.buffer), 5);
                warn!("[{}] No prompt within {timeout:?}", self.port);
                return Err(SessionError::BootTimeout {
                    port: self.port.clone(),
                    timeout,
                    tail,
                });
            }
            if now.duration_since(last_activity) >= self.options.probe_interval {
                debug!("[{}] Console quiet, probing for a prompt", self.port);
                let delimiter = self.options.line_delimiter.clone();
                self.write(delimiter.as_bytes())?;
                last_activity = now;
            }
            if self.fill(deadline)? > 0 {
                last_activity = Instant::now();
            }
        }
    }

    /// Runs `command` and returns its output without the echoed command line
    /// and without the trailing prompt.
    ///
    /// On timeout the session becomes [`SessionState::Unreliable`] and refuses
    /// further commands; the caller should close it and reconnect.
    pub fn send_command(&mut self, command: &str, timeout: Duration) -> Result<String, SessionError> {
        self.ensure_usable()?;
        let result = self.exchange(command, timeout);
        if result.is_err() {
            self.state = SessionState::Unreliable;
        }
        result
    }

    fn exchange(&mut self, command: &str, timeout: Duration) -> Result<String, SessionError> {
        self.discard_pending()?;
        debug!("[{}] > {command}", self.port);
        let line = format!("{command}{}", self.options.line_delimiter);
        self.write(line.as_bytes())?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(output) = self.take_command_output(command) {
                debug!("[{}] < {output:?}", self.port);
                return Ok(output);
            }
            if Instant::now() >= deadline {
                let partial = String::from_utf8_lossy(&self.buffer).into_owned();
                warn!("[{}] `{command}` timed out after {timeout:?}", self.port);
                return Err(SessionError::Timeout {
                    command: command.to_string(),
                    timeout,
                    partial,
                });
            }
            self.fill(deadline)?;
        }
    }

    /// Frames one command response out of the buffer, if complete.
    ///
    /// With echo on, only a prompt after the echoed command line completes the
    /// command; anything before the echo is a late reply to an earlier line.
    /// With echo off, a prompt followed by more output is stale.
    fn take_command_output(&mut self, command: &str) -> Option<String> {
        let prompt = self.options.prompt.as_bytes();
        let (body_start, at) = if self.options.echo {
            let body_start = echo_end(&self.buffer, command)?;
            (body_start, find_prompt(&self.buffer, prompt, body_start)?)
        } else {
            let mut body_start = 0;
            let mut at = find_prompt(&self.buffer, prompt, 0)?;
            while at + prompt.len() < self.buffer.len() {
                body_start = at + prompt.len();
                at = find_prompt(&self.buffer, prompt, body_start)?;
            }
            (body_start, at)
        };
        let output = String::from_utf8_lossy(&self.buffer[body_start..at]).into_owned();
        self.buffer.drain(..at + prompt.len());
        self.last_prompt = Some(Instant::now());
        Some(output)
    }

    /// Drops stale console output (late kernel messages, extra prompts).
    fn discard_pending(&mut self) -> Result<(), SessionError> {
        self.buffer.clear();
        let port = self.port.clone();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SessionError::Closed(port.clone()))?;
        let mut chunk = [0u8; 1024];
        for _ in 0..MAX_DRAIN_READS {
            let n = transport
                .read_chunk(&mut chunk, Duration::ZERO)
                .map_err(|source| SessionError::Io {
                    port: port.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            debug!("[{port}] Discarded {n} stale bytes");
        }
        Ok(())
    }

    /// Reads one chunk, waiting no later than `deadline`.
    fn fill(&mut self, deadline: Instant) -> Result<usize, SessionError> {
        let port = &self.port;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SessionError::Closed(port.clone()))?;
        let wait = deadline.saturating_duration_since(Instant::now()).min(READ_SLICE);
        let mut chunk = [0u8; 4096];
        let n = transport
            .read_chunk(&mut chunk, wait)
            .map_err(|source| SessionError::Io {
                port: port.clone(),
                source,
            })?;
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let port = &self.port;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| SessionError::Closed(port.clone()))?;
        transport.write_all(data).map_err(|source| SessionError::Io {
            port: port.clone(),
            source,
        })
    }

    fn ensure_usable(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Unreliable => Err(SessionError::Unreliable(self.port.clone())),
            SessionState::Closed => Err(SessionError::Closed(self.port.clone())),
        }
    }

    /// Releases the serial handle and the port claim. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transport = None;
        self.guard = None;
        self.buffer.clear();
        self.state = SessionState::Closed;
        debug!("[{}] Session closed", self.port);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// When the prompt was last observed.
    pub fn last_prompt(&self) -> Option<Instant> {
        self.last_prompt
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whether `line` is the shell echoing `command` back.
fn is_echo(line: &str, command: &str) -> bool {
    let line = line.trim_end_matches('\r').trim();
    let command = command.trim();
    if command.is_empty() {
        line.is_empty()
    } else {
        line.ends_with(command)
    }
}

/// Offset just past the first complete line that echoes `command`.
fn echo_end(buffer: &[u8], command: &str) -> Option<usize> {
    let mut start = 0;
    while let Some(eol) = buffer[start..].iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&buffer[start..start + eol]);
        if is_echo(&line, command) {
            return Some(start + eol + 1);
        }
        start += eol + 1;
    }
    None
}

/// Offset of the first `prompt` at or after `from` that begins a line.
fn find_prompt(buffer: &[u8], prompt: &[u8], from: usize) -> Option<usize> {
    if prompt.is_empty() {
        return None;
    }
    let mut at = from;
    while at + prompt.len() <= buffer.len() {
        if &buffer[at..at + prompt.len()] == prompt && starts_line(buffer, at) {
            return Some(at);
        }
        at += 1;
    }
    None
}

fn starts_line(buffer: &[u8], at: usize) -> bool {
    let mut before = &buffer[..at];
    while let [rest @ .., b'\r'] = before {
        before = rest;
    }
    before.is_empty() || before.ends_with(b"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PortRegistry;
    use crate::connection::fake::{FakeShell, ShellScript};
    use std::collections::{HashMap, VecDeque};

    const PROMPT: &str = "(psh)% ";

    fn options() -> SessionOptions {
        SessionOptions {
            prompt: PROMPT.to_string(),
            boot_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_millis(100),
            line_delimiter: "\n".to_string(),
            echo: true,
            interrupt: Some("\x03".to_string()),
        }
    }

    fn open(script: ShellScript) -> Result<Session, SessionError> {
        let registry = PortRegistry::new();
        let (shell, _) = FakeShell::new(script);
        Session::open(registry.acquire("/dev/fake").unwrap(), Box::new(shell), options())
    }

    #[test]
    fn prompt_must_start_a_line() {
        let buf = b"echo (psh)% \r\n(psh)% ";
        assert_eq!(find_prompt(buf, PROMPT.as_bytes(), 0), Some(14));
        assert_eq!(find_prompt(b"(psh)% ", PROMPT.as_bytes(), 0), Some(0));
        assert_eq!(find_prompt(b"x\r\r(psh)% ", PROMPT.as_bytes(), 0), None);
        assert_eq!(find_prompt(b"x\n\r(psh)% ", PROMPT.as_bytes(), 0), Some(3));
        assert_eq!(find_prompt(b"(psh)", PROMPT.as_bytes(), 0), None);
    }

    #[test_log::test]
    fn open_waits_for_prompt_after_banner() {
        let session = open(ShellScript::new(PROMPT)).unwrap();
        assert!(session.is_open());
        assert!(session.last_prompt().is_some());
    }

    #[test_log::test]
    fn open_probes_a_quiet_running_shell() {
        let registry = PortRegistry::new();
        let (shell, handle) = FakeShell::new(ShellScript::new(PROMPT).silent());
        let session =
            Session::open(registry.acquire("/dev/fake").unwrap(), Box::new(shell), options()).unwrap();
        assert!(session.is_open());
        assert!(handle.received().iter().any(|line| line.is_empty()));
    }

    #[test_log::test]
    fn open_times_out_on_dead_console_and_releases_port() {
        let registry = PortRegistry::new();
        let (shell, _) = FakeShell::new(ShellScript::new(PROMPT).dead());
        let err = Session::open(registry.acquire("/dev/fake").unwrap(), Box::new(shell), options())
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::BootTimeout { .. }));
        assert!(err.is_timeout());
        assert!(!registry.is_claimed("/dev/fake"));
    }

    #[test_log::test]
    fn command_output_excludes_echo_and_prompt() {
        let script = ShellScript::new(PROMPT)
            .reply("cat etc/shells", "# /etc/shells: valid login shells\n/bin/sh\n");
        let mut session = open(script).unwrap();
        let output = session
            .send_command("cat etc/shells", Duration::from_secs(1))
            .unwrap();
        assert_eq!(output, "# /etc/shells: valid login shells\r\n/bin/sh\r\n");
        assert!(!output.contains("cat etc/shells"));
        assert!(!output.contains(PROMPT));
    }

    #[test_log::test]
    fn consecutive_commands_stay_in_sync() {
        let script = ShellScript::new(PROMPT)
            .reply("echo one", "one\n")
            .reply("echo two", "two\n");
        let mut session = open(script).unwrap();
        assert_eq!(session.send_command("echo one", Duration::from_secs(1)).unwrap(), "one\r\n");
        assert_eq!(session.send_command("echo two", Duration::from_secs(1)).unwrap(), "two\r\n");
        assert_eq!(session.send_command("", Duration::from_secs(1)).unwrap(), "");
    }

    #[test_log::test]
    fn prompt_text_inside_output_is_not_completion() {
        let script = ShellScript::new(PROMPT).reply("grep psh log", "saw (psh)% here\n");
        let mut session = open(script).unwrap();
        let output = session.send_command("grep psh log", Duration::from_secs(1)).unwrap();
        assert_eq!(output, "saw (psh)% here\r\n");
    }

    #[test_log::test]
    fn timeout_marks_session_unreliable() {
        let script = ShellScript::new(PROMPT).hang("sleep 100");
        let mut session = open(script).unwrap();
        let err = session
            .send_command("sleep 100", Duration::from_millis(150))
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert_eq!(session.state(), SessionState::Unreliable);
        assert!(matches!(
            session.send_command("echo", Duration::from_millis(100)),
            Err(SessionError::Unreliable(_))
        ));
    }

    #[test_log::test]
    fn reconnect_interrupts_running_command() {
        let registry = PortRegistry::new();
        let (shell, handle) = FakeShell::new(ShellScript::new(PROMPT).silent());
        let session =
            Session::reconnect(registry.acquire("/dev/fake").unwrap(), Box::new(shell), options())
                .unwrap();
        assert!(session.is_open());
        assert_eq!(handle.interrupts(), 1);
    }

    #[test]
    fn close_is_idempotent_and_releases_port() {
        let registry = PortRegistry::new();
        let (shell, _) = FakeShell::new(ShellScript::new(PROMPT));
        let mut session =
            Session::open(registry.acquire("/dev/fake").unwrap(), Box::new(shell), options()).unwrap();
        assert!(registry.is_claimed("/dev/fake"));
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!registry.is_claimed("/dev/fake"));
        assert!(matches!(
            session.send_command("ls", Duration::from_millis(10)),
            Err(SessionError::Closed(_))
        ));
    }

    /// Console that answers each line with fixed bytes, prompt and all.
    struct CannedConsole {
        pending: VecDeque<u8>,
        line: Vec<u8>,
        replies: HashMap<String, &'static str>,
    }

    impl CannedConsole {
        fn new(replies: &[(&str, &'static str)]) -> Self {
            Self {
                pending: PROMPT.bytes().collect(),
                line: Vec::new(),
                replies: replies.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
            }
        }
    }

    impl Transport for CannedConsole {
        fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            if self.pending.is_empty() {
                std::thread::sleep(timeout);
                return Ok(0);
            }
            let n = buf.len().min(self.pending.len());
            for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            for &byte in data {
                if byte != b'\n' {
                    self.line.push(byte);
                    continue;
                }
                let line = String::from_utf8_lossy(&self.line).into_owned();
                self.line.clear();
                if let Some(reply) = self.replies.get(&line) {
                    self.pending.extend(reply.bytes());
                }
            }
            Ok(())
        }
    }

    fn open_canned(console: CannedConsole, echo: bool) -> Session {
        let registry = PortRegistry::new();
        let options = SessionOptions { echo, ..options() };
        Session::open(registry.acquire("/dev/canned").unwrap(), Box::new(console), options).unwrap()
    }

    #[test_log::test]
    fn late_prompt_before_echo_is_not_completion() {
        let console = CannedConsole::new(&[(
            "cat etc/shells",
            "\r\n(psh)% cat etc/shells\r\n# /etc/shells: valid login shells\r\n/bin/sh\r\n(psh)% ",
        )]);
        let mut session = open_canned(console, true);
        let output = session
            .send_command("cat etc/shells", Duration::from_secs(1))
            .unwrap();
        assert_eq!(output, "# /etc/shells: valid login shells\r\n/bin/sh\r\n");
    }

    #[test_log::test]
    fn without_echo_a_prompt_followed_by_output_is_stale() {
        let console = CannedConsole::new(&[("uname", "(psh)% Phoenix\r\n(psh)% ")]);
        let mut session = open_canned(console, false);
        let output = session.send_command("uname", Duration::from_secs(1)).unwrap();
        assert_eq!(output, "Phoenix\r\n");
    }

    #[test]
    fn echo_is_found_past_stale_lines() {
        assert_eq!(echo_end(b"\r\n(psh)% ls\r\nbin\r\n", "ls"), Some(13));
        assert_eq!(echo_end(b"bin\r\n", "ls"), None);
        assert_eq!(echo_end(b"(psh)% ls", "ls"), None);
    }

    #[test]
    fn echo_detection() {
        assert!(is_echo("ls -la\r", "ls -la"));
        assert!(is_echo("", ""));
        assert!(!is_echo("something", ""));
        assert!(!is_echo("total 0", "ls"));
    }
}
