//! Individual agent session
//!
//! Each session is driven by one actor task that exclusively owns the process
//! handle, the output broadcaster and every mutable field. Process events and
//! requests from the registry arrive on the same loop, so output, status,
//! subscriber and metadata updates never race.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{OutputBroadcaster, SessionStatus, StatusDetector, StatusInput, Viewer, ViewerEvent, ViewerId};
use crate::pty::{ProcessEvent, ProcessEvents, ProcessHandle, PtyError, Signal, SpawnedProcess, TerminalSize};

/// Errors that can occur during agent session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session has no running process")]
    NotRunning,

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),

    #[error("Session {0} is shutting down")]
    Closed(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Usage snapshot reported by the agent itself
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetrics {
    pub model: String,
    pub cost: f64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub context_percent: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Agent-reported state ("idle", "asking", "working")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// User-chosen presentation overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl SessionOverrides {
    /// Merge an update: provided fields replace, empty strings clear
    pub fn apply(&mut self, update: SessionOverrides) {
        fn merge(slot: &mut Option<String>, value: Option<String>) {
            if let Some(value) = value {
                *slot = if value.is_empty() { None } else { Some(value) };
            }
        }
        merge(&mut self.custom_name, update.custom_name);
        merge(&mut self.custom_color, update.custom_color);
        merge(&mut self.notes, update.notes);
    }
}

/// Descriptive fields fixed when the session is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub node_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub command: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_url: Option<String>,
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    #[serde(flatten)]
    pub meta: SessionMeta,
    #[serde(flatten)]
    pub overrides: SessionOverrides,
    pub status: SessionStatus,
    pub is_restored: bool,
    pub has_process: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<AgentMetrics>,
    pub viewer_count: usize,
    pub backlog_chunks: usize,
    pub recent_output_size: usize,
}

/// Registry-level notification about any session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Created {
        session_id: String,
        node_id: String,
    },
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    Exited {
        session_id: String,
        exit_code: Option<i32>,
    },
    Destroyed {
        session_id: String,
    },
}

/// Tunables for one session actor
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub backlog_chunks: usize,
    pub recent_window: Duration,
    pub refresh_interval: Duration,
    pub window_chars: usize,
    /// Instruction typed into the process once, after `initial_prompt_delay`
    pub initial_prompt: Option<String>,
    pub initial_prompt_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backlog_chunks: 1000,
            recent_window: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(1),
            window_chars: 3000,
            initial_prompt: None,
            initial_prompt_delay: Duration::from_millis(1500),
        }
    }
}

enum SessionCommand {
    Subscribe {
        viewer: Viewer,
        reply: oneshot::Sender<bool>,
    },
    Unsubscribe {
        viewer_id: ViewerId,
    },
    Input {
        data: Vec<u8>,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Resize {
        size: TerminalSize,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Update {
        overrides: SessionOverrides,
        reply: oneshot::Sender<SessionInfo>,
    },
    Metrics {
        metrics: AgentMetrics,
    },
    Snapshot {
        reply: oneshot::Sender<SessionInfo>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of a session actor
#[derive(Clone)]
pub struct SessionHandle {
    session_id: String,
    node_id: String,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Start the actor for a session.
    ///
    /// `process` is `None` for restored placeholders, which start (and stay)
    /// disconnected.
    pub fn spawn(
        meta: SessionMeta,
        overrides: SessionOverrides,
        process: Option<SpawnedProcess>,
        detector: Arc<StatusDetector>,
        options: SessionOptions,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let handle = Self {
            session_id: meta.session_id.clone(),
            node_id: meta.node_id.clone(),
            tx,
        };

        let is_restored = process.is_none();
        let (process, events) = match process {
            Some(spawned) => (Some(spawned.handle), Some(spawned.events)),
            None => (None, None),
        };
        let prompt_at = options
            .initial_prompt
            .as_ref()
            .map(|_| Instant::now() + options.initial_prompt_delay);

        let actor = SessionActor {
            meta,
            overrides,
            metrics: None,
            is_restored,
            status: if is_restored {
                SessionStatus::Disconnected
            } else {
                SessionStatus::Starting
            },
            process,
            broadcaster: OutputBroadcaster::new(options.backlog_chunks, options.recent_window),
            last_input: None,
            detector,
            window_chars: options.window_chars,
            pending_prompt: options.initial_prompt,
            events_tx,
        };

        tokio::spawn(actor.run(rx, events, options.refresh_interval, prompt_at));
        handle
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> SessionResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))?;
        rx.await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))
    }

    /// Attach a viewer; it first receives the backlog
    pub async fn subscribe(&self, viewer: Viewer) -> SessionResult<bool> {
        self.request(|reply| SessionCommand::Subscribe { viewer, reply })
            .await
    }

    /// Detach a viewer. A gone session or unknown viewer is fine.
    pub async fn unsubscribe(&self, viewer_id: ViewerId) {
        let _ = self
            .tx
            .send(SessionCommand::Unsubscribe { viewer_id })
            .await;
    }

    /// Forward viewer keystrokes to the process
    pub async fn input(&self, data: Vec<u8>) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Input { data, reply })
            .await?
    }

    pub async fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        self.request(|reply| SessionCommand::Resize { size, reply })
            .await?
    }

    pub async fn update(&self, overrides: SessionOverrides) -> SessionResult<SessionInfo> {
        self.request(|reply| SessionCommand::Update { overrides, reply })
            .await
    }

    pub async fn set_metrics(&self, metrics: AgentMetrics) -> SessionResult<()> {
        self.tx
            .send(SessionCommand::Metrics { metrics })
            .await
            .map_err(|_| SessionError::Closed(self.session_id.clone()))
    }

    pub async fn snapshot(&self) -> SessionResult<SessionInfo> {
        self.request(|reply| SessionCommand::Snapshot { reply }).await
    }

    /// Kill the process (if any), close all subscriptions and stop the actor
    pub async fn destroy(&self) {
        if self
            .request(|reply| SessionCommand::Destroy { reply })
            .await
            .is_err()
        {
            debug!("Session {} already stopped", self.session_id);
        }
    }
}

struct SessionActor {
    meta: SessionMeta,
    overrides: SessionOverrides,
    metrics: Option<AgentMetrics>,
    is_restored: bool,
    status: SessionStatus,
    process: Option<Box<dyn ProcessHandle>>,
    broadcaster: OutputBroadcaster,
    last_input: Option<Instant>,
    detector: Arc<StatusDetector>,
    window_chars: usize,
    pending_prompt: Option<String>,
    events_tx: broadcast::Sender<SessionEvent>,
}

async fn next_event(events: &mut Option<ProcessEvents>) -> Option<ProcessEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: Option<ProcessEvents>,
        refresh_interval: Duration,
        prompt_at: Option<Instant>,
    ) {
        let mut ticker = tokio::time::interval(refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        self.teardown();
                        break;
                    }
                },
                event = next_event(&mut events), if events.is_some() => match event {
                    Some(ProcessEvent::Data(data)) => self.on_output(data),
                    Some(ProcessEvent::Exit { code }) => {
                        self.on_exit(code);
                        events = None;
                    }
                    None => {
                        self.on_exit(None);
                        events = None;
                    }
                },
                _ = ticker.tick(), if self.process.is_some() => {
                    // An input failure sticks until the process writes again
                    if self.status != SessionStatus::Error {
                        self.refresh_status(Instant::now());
                    }
                }
                _ = wait_until(prompt_at), if self.pending_prompt.is_some() => {
                    self.send_initial_prompt();
                }
            }
        }

        debug!("Session {} actor stopped", self.meta.session_id);
    }

    /// Apply one command. Returns false once the actor should stop.
    fn handle(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Subscribe { viewer, reply } => {
                let attached = self.broadcaster.subscribe(viewer);
                let _ = reply.send(attached);
            }
            SessionCommand::Unsubscribe { viewer_id } => {
                self.broadcaster.unsubscribe(viewer_id);
            }
            SessionCommand::Input { data, reply } => {
                let _ = reply.send(self.write_input(&data));
            }
            SessionCommand::Resize { size, reply } => {
                let result = match self.process.as_mut() {
                    Some(process) => process.resize(size).map_err(SessionError::from),
                    None => Err(SessionError::NotRunning),
                };
                let _ = reply.send(result);
            }
            SessionCommand::Update { overrides, reply } => {
                self.overrides.apply(overrides);
                let _ = reply.send(self.info(Instant::now()));
            }
            SessionCommand::Metrics { metrics } => {
                self.metrics = Some(metrics);
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.info(Instant::now()));
            }
            SessionCommand::Destroy { reply } => {
                self.teardown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn write_input(&mut self, data: &[u8]) -> SessionResult<()> {
        let process = self.process.as_mut().ok_or(SessionError::NotRunning)?;
        match process.write(data) {
            Ok(()) => {
                self.last_input = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                warn!("Input to session {} failed: {}", self.meta.session_id, e);
                self.set_status(SessionStatus::Error);
                Err(e.into())
            }
        }
    }

    fn send_initial_prompt(&mut self) {
        let Some(prompt) = self.pending_prompt.take() else {
            return;
        };
        if self.process.is_none() {
            return;
        }
        debug!(
            "Sending initial prompt ({} bytes) to session {}",
            prompt.len(),
            self.meta.session_id
        );
        let mut data = prompt.into_bytes();
        data.push(b'\r');
        let _ = self.write_input(&data);
    }

    fn on_output(&mut self, data: Vec<u8>) {
        let now = Instant::now();
        self.broadcaster.broadcast(data, now);
        self.refresh_status(now);
    }

    fn on_exit(&mut self, code: Option<i32>) {
        info!(
            "Session {} process exited with code {:?}",
            self.meta.session_id, code
        );
        self.process = None;
        self.pending_prompt = None;
        self.broadcaster.finish(code);
        let _ = self.events_tx.send(SessionEvent::Exited {
            session_id: self.meta.session_id.clone(),
            exit_code: code,
        });
        self.set_status(SessionStatus::Disconnected);
    }

    fn teardown(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill(Signal::Hangup) {
                warn!("Failed to kill session {}: {}", self.meta.session_id, e);
            }
        }
        self.broadcaster.close_all();
    }

    fn refresh_status(&mut self, now: Instant) {
        // Stay "starting" until the process says something
        if self.status == SessionStatus::Starting && self.broadcaster.last_output().is_none() {
            return;
        }

        let text = self.broadcaster.backlog().tail_text(self.window_chars);
        let input = StatusInput {
            text: &text,
            since_output: self
                .broadcaster
                .last_output()
                .map(|at| now.saturating_duration_since(at)),
            since_input: self.last_input.map(|at| now.saturating_duration_since(at)),
            recent_output_size: self.broadcaster.recent_output_size(now),
            has_process: self.process.is_some(),
            is_restored: self.is_restored,
        };
        let status = self.detector.classify(&input);
        self.set_status(status);
    }

    fn set_status(&mut self, status: SessionStatus) {
        if status == self.status {
            return;
        }
        debug!(
            "Session {} status {} -> {}",
            self.meta.session_id, self.status, status
        );
        self.status = status;
        self.broadcaster.notify(ViewerEvent::Status(status));
        let _ = self.events_tx.send(SessionEvent::StatusChanged {
            session_id: self.meta.session_id.clone(),
            status,
        });
    }

    fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            meta: self.meta.clone(),
            overrides: self.overrides.clone(),
            status: self.status,
            is_restored: self.is_restored,
            has_process: self.process.is_some(),
            metrics: self.metrics.clone(),
            viewer_count: self.broadcaster.viewer_count(),
            backlog_chunks: self.broadcaster.backlog().len(),
            recent_output_size: self.broadcaster.recent_output_size(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::fake::FakeAdapter;
    use crate::pty::{ProcessAdapter, SpawnRequest};
    use tokio::time::timeout;

    fn meta(id: &str) -> SessionMeta {
        SessionMeta {
            session_id: format!("session-{id}"),
            node_id: format!("node-{id}"),
            agent_id: "shell".to_string(),
            agent_name: "Terminal".to_string(),
            command: "sh".to_string(),
            cwd: "/tmp".to_string(),
            git_branch: None,
            worktree_path: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
            ticket_id: None,
            ticket_title: None,
            ticket_url: None,
        }
    }

    fn start(adapter: &FakeAdapter, options: SessionOptions) -> SessionHandle {
        let spawned = adapter.spawn(&SpawnRequest::new("sh", "/tmp")).unwrap();
        let (events_tx, _) = broadcast::channel(64);
        SessionHandle::spawn(
            meta("a"),
            SessionOverrides::default(),
            Some(spawned),
            Arc::new(StatusDetector::default()),
            options,
            events_tx,
        )
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ViewerEvent>) -> ViewerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for viewer event")
            .expect("viewer channel closed")
    }

    async fn next_output(rx: &mut mpsc::UnboundedReceiver<ViewerEvent>) -> Vec<u8> {
        loop {
            if let ViewerEvent::Output(data) = next(rx).await {
                return data.to_vec();
            }
        }
    }

    #[test]
    fn test_overrides_apply() {
        let mut overrides = SessionOverrides {
            custom_name: Some("old".to_string()),
            notes: Some("keep".to_string()),
            ..Default::default()
        };
        overrides.apply(SessionOverrides {
            custom_name: Some(String::new()),
            custom_color: Some("#fff".to_string()),
            notes: None,
        });
        assert_eq!(overrides.custom_name, None);
        assert_eq!(overrides.custom_color.as_deref(), Some("#fff"));
        assert_eq!(overrides.notes.as_deref(), Some("keep"));
    }

    #[test]
    fn test_session_info_serialization() {
        let info = SessionInfo {
            meta: meta("a"),
            overrides: SessionOverrides {
                custom_name: Some("Reviewer".to_string()),
                ..Default::default()
            },
            status: SessionStatus::WaitingInput,
            is_restored: false,
            has_process: true,
            metrics: None,
            viewer_count: 2,
            backlog_chunks: 10,
            recent_output_size: 0,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"sessionId\":\"session-a\""));
        assert!(json.contains("\"customName\":\"Reviewer\""));
        assert!(json.contains("\"status\":\"waiting_input\""));

        let parsed: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }

    #[tokio::test]
    async fn test_starts_in_starting_then_classifies_output() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());
        assert_eq!(
            session.snapshot().await.unwrap().status,
            SessionStatus::Starting
        );

        let (viewer, mut rx) = Viewer::channel();
        assert!(session.subscribe(viewer).await.unwrap());

        adapter.emit(0, b"Apply this change? (y/n)");
        assert_eq!(next_output(&mut rx).await, b"Apply this change? (y/n)");
        assert_eq!(next(&mut rx).await, ViewerEvent::Status(SessionStatus::WaitingInput));
    }

    #[tokio::test]
    async fn test_input_reaches_process() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());

        session.input(b"ls\r".to_vec()).await.unwrap();
        assert_eq!(adapter.written(0), b"ls\r");

        session.resize(TerminalSize::new(132, 43)).await.unwrap();
        assert_eq!(adapter.last_size(0), Some(TerminalSize::new(132, 43)));
    }

    #[tokio::test]
    async fn test_failed_input_marks_error() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());
        adapter.fail_writes(true);

        let result = session.input(b"x".to_vec()).await;
        assert!(matches!(result, Err(SessionError::Pty(_))));
        assert_eq!(session.snapshot().await.unwrap().status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn test_exit_keeps_backlog_and_notifies() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());
        let (viewer, mut rx) = Viewer::channel();
        session.subscribe(viewer).await.unwrap();

        adapter.emit(0, b"bye\n");
        adapter.exit(0, Some(2));

        assert_eq!(next_output(&mut rx).await, b"bye\n");
        loop {
            if let ViewerEvent::Exited { code } = next(&mut rx).await {
                assert_eq!(code, Some(2));
                break;
            }
        }

        let info = session.snapshot().await.unwrap();
        assert_eq!(info.status, SessionStatus::Disconnected);
        assert!(!info.has_process);
        assert_eq!(info.backlog_chunks, 1);
        assert!(matches!(
            session.input(b"x".to_vec()).await,
            Err(SessionError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_viewer_attached_after_exit_sees_exit() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());
        adapter.emit(0, b"last words\n");
        adapter.exit(0, Some(7));

        timeout(Duration::from_secs(2), async {
            while session.snapshot().await.unwrap().has_process {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("process never exited");

        let (viewer, mut rx) = Viewer::channel();
        assert!(session.subscribe(viewer).await.unwrap());
        assert_eq!(next(&mut rx).await, ViewerEvent::Output(b"last words\n".to_vec().into()));
        assert_eq!(next(&mut rx).await, ViewerEvent::Exited { code: Some(7) });
    }

    #[tokio::test]
    async fn test_initial_prompt_written_once() {
        let adapter = FakeAdapter::new();
        let session = start(
            &adapter,
            SessionOptions {
                initial_prompt: Some("Fix the bug".to_string()),
                initial_prompt_delay: Duration::from_millis(20),
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        session.snapshot().await.unwrap();
        assert_eq!(adapter.written(0), b"Fix the bug\r");
    }

    #[tokio::test]
    async fn test_destroy_kills_once_and_closes_viewers() {
        let adapter = FakeAdapter::new();
        let session = start(&adapter, SessionOptions::default());
        let (viewer, mut rx) = Viewer::channel();
        session.subscribe(viewer).await.unwrap();

        session.destroy().await;
        session.destroy().await;

        assert_eq!(adapter.kill_count(0), 1);
        assert_eq!(next(&mut rx).await, ViewerEvent::Closed);
        assert!(matches!(
            session.snapshot().await,
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_placeholder_is_disconnected() {
        let (events_tx, _) = broadcast::channel(8);
        let session = SessionHandle::spawn(
            meta("restored"),
            SessionOverrides::default(),
            None,
            Arc::new(StatusDetector::default()),
            SessionOptions::default(),
            events_tx,
        );

        let info = session.snapshot().await.unwrap();
        assert!(info.is_restored);
        assert!(!info.has_process);
        assert_eq!(info.status, SessionStatus::Disconnected);
        assert!(matches!(
            session.resize(TerminalSize::default()).await,
            Err(SessionError::NotRunning)
        ));
    }
}
