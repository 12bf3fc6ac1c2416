//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port and handles
//! connections from canvas clients. Each connection can attach to any number
//! of sessions; attachments are released when the connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{
    AgentSummary, ClientEnvelope, ClientMessage, ErrorCode, OutputDecoder, ServerEnvelope,
    ServerMessage,
};
use crate::agent::{
    CreateOptions, RegistryError, SessionEvent, SessionOverrides, SessionRegistry, Viewer,
    ViewerEvent, ViewerId,
};
use crate::layout::PersistedLayout;
use crate::pty::TerminalSize;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Directory sessions start in unless a request names another
    pub project_dir: PathBuf,
}

impl ServerConfig {
    pub fn new(bind: String, port: u16, project_dir: PathBuf) -> Self {
        Self {
            bind,
            port,
            project_dir,
        }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for canvas client connections
pub struct WebSocketServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, registry: Arc<SessionRegistry>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the WebSocket server
    ///
    /// Listens for incoming connections and handles them concurrently until a
    /// shutdown signal is received.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}/ws", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let project_dir = self.config.project_dir.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, project_dir, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        Ok(())
    }
}

struct Attachment {
    viewer_id: ViewerId,
    task: JoinHandle<()>,
}

/// Per-connection state: the outgoing queue and the sessions this client
/// is attached to
struct Connection {
    peer_addr: SocketAddr,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
    attachments: HashMap<String, Attachment>,
}

impl Connection {
    fn new(peer_addr: SocketAddr, out_tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            peer_addr,
            out_tx,
            attachments: HashMap::new(),
        }
    }

    async fn attach(&mut self, registry: &SessionRegistry, session_id: &str) -> Result<(), RegistryError> {
        if let Some(attachment) = self.attachments.get(session_id) {
            if !attachment.task.is_finished() {
                return Ok(());
            }
            // The relay ended with the session it was attached to
            self.forget(session_id);
        }

        let (viewer, rx) = Viewer::channel();
        let viewer_id = viewer.id();
        registry.subscribe(session_id, viewer).await?;

        let task = tokio::spawn(forward_viewer_events(
            session_id.to_string(),
            rx,
            self.out_tx.clone(),
        ));
        self.attachments
            .insert(session_id.to_string(), Attachment { viewer_id, task });
        debug!("{} attached to session {}", self.peer_addr, session_id);
        Ok(())
    }

    async fn detach(&mut self, registry: &SessionRegistry, session_id: &str) {
        if let Some(attachment) = self.attachments.remove(session_id) {
            registry.unsubscribe(session_id, attachment.viewer_id).await;
            attachment.task.abort();
            debug!("{} detached from session {}", self.peer_addr, session_id);
        }
    }

    /// Drop the attachment of a session that no longer exists
    fn forget(&mut self, session_id: &str) {
        if let Some(attachment) = self.attachments.remove(session_id) {
            attachment.task.abort();
            debug!("{} released destroyed session {}", self.peer_addr, session_id);
        }
    }

    async fn detach_all(&mut self, registry: &SessionRegistry) {
        let session_ids: Vec<String> = self.attachments.keys().cloned().collect();
        for session_id in session_ids {
            self.detach(registry, &session_id).await;
        }
    }
}

/// Relay one attachment's viewer events to the connection
async fn forward_viewer_events(
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<ViewerEvent>,
    out_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut decoder = OutputDecoder::new();

    while let Some(event) = rx.recv().await {
        let message = match event {
            ViewerEvent::Output(data) => {
                ServerMessage::output(session_id.clone(), decoder.decode(&data))
            }
            ViewerEvent::Exited { code } => ServerMessage::Exited {
                session_id: session_id.clone(),
                exit_code: code,
            },
            // Status reaches every connection through registry events
            ViewerEvent::Status(_) => continue,
            ViewerEvent::Closed => break,
        };
        if out_tx.send(message).is_err() {
            break;
        }
    }
}

/// Turn a registry event into the notification sent to every connection
async fn event_message(registry: &SessionRegistry, event: SessionEvent) -> Option<ServerMessage> {
    match event {
        SessionEvent::Created { session_id, .. } => match registry.get(&session_id).await {
            Ok(session) => Some(ServerMessage::SessionCreated { session }),
            Err(e) => {
                debug!("Created session {} vanished: {}", session_id, e);
                None
            }
        },
        SessionEvent::StatusChanged { session_id, status } => {
            Some(ServerMessage::Status { session_id, status })
        }
        SessionEvent::Destroyed { session_id } => {
            Some(ServerMessage::SessionDestroyed { session_id })
        }
        // Exit markers travel in order with the output of attached sessions
        SessionEvent::Exited { .. } => None,
    }
}

async fn send_message<S>(ws_sender: &mut S, message: ServerMessage) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = ServerEnvelope::new(message).to_json()?;
    ws_sender.send(Message::Text(json)).await?;
    Ok(())
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    project_dir: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let mut connection = Connection::new(peer_addr, out_tx);
    let mut events = registry.subscribe_events();

    send_message(&mut ws_sender, ServerMessage::welcome()).await?;
    debug!("Sent welcome message to {}", peer_addr);

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {} bytes", peer_addr, text.len());
                            let response = handle_message(&text, &registry, &project_dir, &mut connection).await;
                            send_message(&mut ws_sender, response).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                Some(message) = out_rx.recv() => {
                    send_message(&mut ws_sender, message).await?;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let SessionEvent::Destroyed { session_id } = &event {
                                connection.forget(session_id);
                            }
                            if let Some(message) = event_message(&registry, event).await {
                                send_message(&mut ws_sender, message).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Connection {} lagged by {} session events", peer_addr, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    connection.detach_all(&registry).await;
    info!("Connection from {} closed", peer_addr);
    result
}

fn resolve_cwd(project_dir: &Path, cwd: Option<String>) -> PathBuf {
    match cwd {
        Some(cwd) if Path::new(&cwd).is_absolute() => PathBuf::from(cwd),
        Some(cwd) => project_dir.join(cwd),
        None => project_dir.to_path_buf(),
    }
}

fn registry_error(session_id: Option<&str>, err: RegistryError) -> ServerMessage {
    let code = ErrorCode::from(&err);
    match session_id {
        Some(session_id) => ServerMessage::session_error(session_id, err.to_string(), code),
        None => ServerMessage::error_with_code(err.to_string(), code),
    }
}

/// Handle a client message and return the response
async fn handle_message(
    text: &str,
    registry: &SessionRegistry,
    project_dir: &Path,
    connection: &mut Connection,
) -> ServerMessage {
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Rejected message from {}: {}", connection.peer_addr, e);
            return e.into();
        }
    };

    match envelope.message {
        ClientMessage::Ping { seq } => ServerMessage::pong(seq),

        ClientMessage::ListAgents => ServerMessage::AgentList {
            agents: registry.agents().iter().map(AgentSummary::from).collect(),
        },

        ClientMessage::CreateSession {
            agent_id,
            cwd,
            node_id,
            custom_name,
            custom_color,
            position,
            cols,
            rows,
        } => {
            let defaults = registry.settings().session.terminal_size();
            let options = CreateOptions {
                node_id,
                overrides: SessionOverrides {
                    custom_name,
                    custom_color,
                    notes: None,
                },
                position,
                size: Some(TerminalSize::new(
                    cols.unwrap_or(defaults.cols),
                    rows.unwrap_or(defaults.rows),
                )),
                ..Default::default()
            };
            let cwd = resolve_cwd(project_dir, cwd);
            match registry.create_for(&agent_id, &cwd, options).await {
                Ok(created) => session_response(registry, &created.session_id).await,
                Err(e) => registry_error(None, e),
            }
        }

        ClientMessage::StartTicket {
            agent_id,
            ticket,
            cwd,
            node_id,
            position,
            worktree,
        } => {
            let Some(agent) = registry.settings().find_agent(&agent_id).cloned() else {
                return registry_error(None, RegistryError::UnknownAgent(agent_id));
            };
            let options = CreateOptions {
                node_id,
                position,
                worktree_branch: worktree.then(|| ticket.branch_name()),
                ..Default::default()
            };
            let cwd = resolve_cwd(project_dir, cwd);
            match registry.create_from_ticket(&agent, &cwd, ticket, options).await {
                Ok(created) => session_response(registry, &created.session_id).await,
                Err(e) => registry_error(None, e),
            }
        }

        ClientMessage::DestroySession { session_id } => {
            connection.detach(registry, &session_id).await;
            match registry.destroy(&session_id).await {
                Ok(()) => ServerMessage::Ok,
                Err(e) => registry_error(Some(&session_id), e),
            }
        }

        ClientMessage::ListSessions => ServerMessage::SessionList {
            sessions: registry.list().await,
        },

        ClientMessage::GetSession { session_id } => session_response(registry, &session_id).await,

        ClientMessage::Attach { session_id } => {
            match connection.attach(registry, &session_id).await {
                Ok(()) => ServerMessage::Ok,
                Err(e) => registry_error(Some(&session_id), e),
            }
        }

        ClientMessage::Detach { session_id } => {
            connection.detach(registry, &session_id).await;
            ServerMessage::Ok
        }

        ClientMessage::Input { session_id, data } => {
            match registry.input(&session_id, data.into_bytes()).await {
                Ok(()) => ServerMessage::Ok,
                Err(e) => registry_error(Some(&session_id), e),
            }
        }

        ClientMessage::Resize {
            session_id,
            cols,
            rows,
        } => match registry.resize(&session_id, TerminalSize::new(cols, rows)).await {
            Ok(()) => ServerMessage::Ok,
            Err(e) => registry_error(Some(&session_id), e),
        },

        ClientMessage::UpdateSession {
            session_id,
            custom_name,
            custom_color,
            notes,
        } => {
            let overrides = SessionOverrides {
                custom_name,
                custom_color,
                notes,
            };
            match registry.update_overrides(&session_id, overrides).await {
                Ok(session) => ServerMessage::Session { session },
                Err(e) => registry_error(Some(&session_id), e),
            }
        }

        ClientMessage::UpdatePositions { positions } => {
            if let Some(layout) = registry.layout() {
                layout.set_positions(positions);
            }
            ServerMessage::Ok
        }

        ClientMessage::SetCategories { categories } => {
            if let Some(layout) = registry.layout() {
                layout.set_categories(categories);
            }
            ServerMessage::Ok
        }

        ClientMessage::GetLayout => {
            let layout = match registry.layout() {
                Some(layout) => layout.snapshot().await,
                None => PersistedLayout::default(),
            };
            ServerMessage::Layout { layout }
        }
    }
}

async fn session_response(registry: &SessionRegistry, session_id: &str) -> ServerMessage {
    match registry.get(session_id).await {
        Ok(session) => ServerMessage::Session { session },
        Err(e) => registry_error(Some(session_id), e),
    }
}
