//! PTY process management
//!
//! Defines the process adapter contract the session registry spawns through,
//! and the native implementation backed by portable-pty:
//! - Spawning a command inside a pseudo-terminal
//! - Ordered data events followed by exactly one exit event
//! - Input, resize and kill on the owned handle

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows.max(1),
            cols: self.cols.max(1),
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Signal requested when killing a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Terminal hangup, the usual way to end an interactive program
    Hangup,
    /// Polite termination request
    Terminate,
    /// Forced termination
    Kill,
}

/// Asynchronous notification from a spawned process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of raw terminal output
    Data(Vec<u8>),
    /// The process exited. Sent exactly once, after every `Data` event.
    Exit { code: Option<i32> },
}

/// Single-owner stream of events for one process
pub type ProcessEvents = mpsc::UnboundedReceiver<ProcessEvent>;

/// Everything needed to start one interactive process
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Program to run
    pub command: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Working directory
    pub cwd: PathBuf,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Initial terminal size
    pub size: TerminalSize,
}

impl SpawnRequest {
    /// Create a request with no arguments and the default terminal size
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: HashMap::new(),
            size: TerminalSize::default(),
        }
    }

    /// Set program arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the initial terminal size
    pub fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    /// The command line as it would be typed in a shell
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Control side of a spawned process. Owned by exactly one session.
pub trait ProcessHandle: Send {
    /// Write raw bytes to the process input
    fn write(&mut self, data: &[u8]) -> PtyResult<()>;

    /// Resize the terminal
    fn resize(&mut self, size: TerminalSize) -> PtyResult<()>;

    /// Terminate the process. The exit event still arrives on the event stream.
    fn kill(&mut self, signal: Signal) -> PtyResult<()>;

    /// OS process id, when known
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A freshly spawned process: its handle plus its event stream
pub struct SpawnedProcess {
    pub handle: Box<dyn ProcessHandle>,
    pub events: ProcessEvents,
}

/// Capability to start interactive processes
pub trait ProcessAdapter: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> PtyResult<SpawnedProcess>;
}

/// Process adapter backed by the native pseudo-terminal system
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyAdapter;

impl PtyAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Reader loop that runs in a dedicated thread.
    ///
    /// Forwards output until EOF, then reaps the child and reports its exit
    /// code. This is the only place an `Exit` event is produced.
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
        events_tx: mpsc::UnboundedSender<ProcessEvent>,
    ) {
        let mut buffer = [0u8; 8192];

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if events_tx.send(ProcessEvent::Data(buffer[..n].to_vec())).is_err() {
                        // Nobody is listening anymore
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                // EIO once the slave side closes
                Err(_) => break,
            }
        }

        let code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!("Failed to reap child process: {}", e);
                None
            }
        };
        debug!("PTY child exited with code {:?}", code);
        let _ = events_tx.send(ProcessEvent::Exit { code });
    }
}

impl ProcessAdapter for PtyAdapter {
    fn spawn(&self, request: &SpawnRequest) -> PtyResult<SpawnedProcess> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(request.size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&request.command);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Drop the slave - we only need the master
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        let killer = child.clone_killer();
        let pid = child.process_id();

        let (events_tx, events) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || Self::reader_loop(reader, child, events_tx))
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        debug!("Spawned '{}' (pid {:?})", request.command_line(), pid);

        Ok(SpawnedProcess {
            handle: Box::new(PtyHandle {
                master: pair.master,
                writer,
                killer,
                pid,
            }),
            events,
        })
    }
}

/// Handle to a process running under the native PTY
struct PtyHandle {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl ProcessHandle for PtyHandle {
    fn write(&mut self, data: &[u8]) -> PtyResult<()> {
        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn resize(&mut self, size: TerminalSize) -> PtyResult<()> {
        self.master
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    fn kill(&mut self, signal: Signal) -> PtyResult<()> {
        // portable-pty exposes a single termination primitive
        debug!("Killing pid {:?} ({:?})", self.pid, signal);
        self.killer
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}
