//! In-memory shell used by unit tests.
//!
//! Behaves like a line-oriented device shell: echoes each received line,
//! answers from a script, prints the prompt, and hands bytes out in small
//! fragments to exercise reassembly.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::serial_config::SerialConfig;
use crate::connection::{Connector, Transport};
use crate::session::SessionError;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Output(String),
    /// Never returns to the prompt
    Hang,
}

#[derive(Debug, Clone)]
pub(crate) struct ShellScript {
    pub prompt: String,
    pub banner: Option<String>,
    pub echo: bool,
    pub chunk: usize,
    pub replies: HashMap<String, Reply>,
    /// Ignores everything, including probes
    pub dead: bool,
}

impl ShellScript {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            banner: Some(format!("Phoenix-RTOS booting\r\n\r\n{prompt}")),
            echo: true,
            chunk: 7,
            replies: HashMap::new(),
            dead: false,
        }
    }

    pub fn reply(mut self, command: &str, output: &str) -> Self {
        self.replies
            .insert(command.to_string(), Reply::Output(output.to_string()));
        self
    }

    pub fn hang(mut self, command: &str) -> Self {
        self.replies.insert(command.to_string(), Reply::Hang);
        self
    }

    pub fn silent(mut self) -> Self {
        self.banner = None;
        self
    }

    pub fn dead(mut self) -> Self {
        self.banner = None;
        self.dead = true;
        self
    }
}

#[derive(Debug, Default)]
struct FakeState {
    pending: VecDeque<u8>,
    line: Vec<u8>,
    received: Vec<String>,
    interrupts: usize,
}

pub(crate) struct FakeShell {
    script: ShellScript,
    state: Arc<Mutex<FakeState>>,
}

/// Observer for what a [`FakeShell`] received.
#[derive(Clone)]
pub(crate) struct FakeHandle {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    pub fn received(&self) -> Vec<String> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.state.lock().unwrap().interrupts
    }
}

impl FakeShell {
    pub fn new(script: ShellScript) -> (Self, FakeHandle) {
        let mut state = FakeState::default();
        if let Some(banner) = &script.banner {
            state.pending.extend(banner.as_bytes());
        }
        let state = Arc::new(Mutex::new(state));
        let handle = FakeHandle {
            state: Arc::clone(&state),
        };
        (Self { script, state }, handle)
    }

    fn answer(&self, state: &mut FakeState, line: &str) {
        state.received.push(line.to_string());
        if self.script.echo {
            state.pending.extend(format!("{line}\r\n").as_bytes());
        }
        let body = match self.script.replies.get(line) {
            Some(Reply::Hang) => return,
            Some(Reply::Output(text)) => text.replace('\n', "\r\n"),
            None if line.trim().is_empty() => String::new(),
            None => format!("psh: {line}: unknown command\r\n"),
        };
        state.pending.extend(body.as_bytes());
        state.pending.extend(self.script.prompt.as_bytes());
    }
}

impl Transport for FakeShell {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.pending.is_empty() {
            drop(state);
            thread::sleep(timeout.min(Duration::from_millis(2)));
            return Ok(0);
        }
        let n = buf.len().min(self.script.chunk).min(state.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.pending.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.script.dead {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        for &byte in data {
            match byte {
                0x03 => {
                    state.interrupts += 1;
                    state.line.clear();
                    let prompt = format!("^C\r\n{}", self.script.prompt);
                    state.pending.extend(prompt.as_bytes());
                }
                b'\n' => {
                    let raw = std::mem::take(&mut state.line);
                    let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
                    self.answer(&mut state, &line);
                }
                _ => state.line.push(byte),
            }
        }
        Ok(())
    }
}

/// Hands out a fresh [`FakeShell`] per connect, optionally failing.
pub(crate) struct FakeConnector {
    scripts: Mutex<VecDeque<ShellScript>>,
    fallback: Option<ShellScript>,
    pub connects: AtomicUsize,
    handles: Mutex<Vec<FakeHandle>>,
}

impl FakeConnector {
    /// Every connect gets a shell running `script`.
    pub fn always(script: ShellScript) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Some(script),
            connects: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Connects consume `scripts` in order; further connects fail.
    pub fn sequence(scripts: Vec<ShellScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            connects: AtomicUsize::new(0),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> Vec<FakeHandle> {
        self.handles.lock().unwrap().clone()
    }
}

impl Connector for FakeConnector {
    fn connect(&self, serial: &SerialConfig) -> Result<Box<dyn Transport>, SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| SessionError::Open {
                port: serial.port.clone(),
                reason: "no such device".to_string(),
            })?;
        let (shell, handle) = FakeShell::new(script);
        self.handles.lock().unwrap().push(handle);
        Ok(Box::new(shell))
    }
}
