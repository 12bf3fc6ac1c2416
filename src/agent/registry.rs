//! Session registry
//!
//! Owns the map of sessions by id. The map is only locked to insert, remove or
//! look up a handle; everything that touches a session goes to its actor.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    AgentMetrics, SessionError, SessionEvent, SessionHandle, SessionInfo, SessionMeta,
    SessionOptions, SessionOverrides, StatusDetector, Viewer, ViewerId,
};
use crate::config::{AgentDefinition, Settings};
use crate::git::{self, GitError};
use crate::layout::restore::{self, RestoreAction};
use crate::layout::{LayoutWriter, PersistedLayout, PersistedNode, Position};
use crate::pty::{ProcessAdapter, PtyError, TerminalSize};
use crate::ticket::{render_prompt, TicketRequest};

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Node {0} already has a session")]
    DuplicateNode(String),

    #[error("Session {0} already exists")]
    DuplicateSession(String),

    #[error("Invalid working directory: {0}")]
    InvalidPath(String),

    #[error("Failed to spawn agent: {0}")]
    Spawn(#[source] PtyError),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Optional parameters for [`SessionRegistry::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Reuse this session id instead of allocating one
    pub session_id: Option<String>,
    /// Reuse this canvas node id instead of allocating one
    pub node_id: Option<String>,
    pub overrides: SessionOverrides,
    pub position: Option<Position>,
    pub size: Option<TerminalSize>,
    /// Run the session in a worktree checked out on this branch
    pub worktree_branch: Option<String>,
    pub ticket: Option<TicketRequest>,
    /// Typed into the process once it had time to start
    pub initial_prompt: Option<String>,
    /// Keep this creation time (restored sessions)
    pub created_at: Option<String>,
}

/// Identifiers of a newly created session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: String,
    pub node_id: String,
}

/// Outcome of [`SessionRegistry::restore`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub attached: usize,
    pub resumed: usize,
    pub placeholders: usize,
    /// Node ids whose agent is no longer configured
    pub orphaned: Vec<String>,
}

/// Manages all agent sessions
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    adapter: Arc<dyn ProcessAdapter>,
    detector: Arc<StatusDetector>,
    settings: Settings,
    layout: Option<LayoutWriter>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Create a registry. Without a layout writer nothing is persisted.
    pub fn new(
        adapter: Arc<dyn ProcessAdapter>,
        settings: Settings,
        layout: Option<LayoutWriter>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            sessions: RwLock::new(HashMap::new()),
            adapter,
            detector: Arc::new(StatusDetector::new(&settings.status)),
            settings,
            layout,
            event_tx,
        }
    }

    /// Subscribe to registry-level session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn agents(&self) -> &[AgentDefinition] {
        &self.settings.agents
    }

    pub fn layout(&self) -> Option<&LayoutWriter> {
        self.layout.as_ref()
    }

    /// Get the number of sessions, placeholders included
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn session_options(&self, initial_prompt: Option<String>) -> SessionOptions {
        SessionOptions {
            backlog_chunks: self.settings.session.backlog_chunks,
            recent_window: self.settings.status.recent_window(),
            refresh_interval: self.settings.status.refresh_interval(),
            window_chars: self.settings.status.window_chars,
            initial_prompt,
            initial_prompt_delay: self.settings.session.initial_prompt_delay(),
        }
    }

    async fn handle(&self, session_id: &str) -> RegistryResult<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.to_string()))
    }

    async fn ensure_ids_free(&self, node_id: &str, session_id: &str) -> RegistryResult<()> {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(session_id) {
            return Err(RegistryError::DuplicateSession(session_id.to_string()));
        }
        if sessions.values().any(|s| s.node_id() == node_id) {
            return Err(RegistryError::DuplicateNode(node_id.to_string()));
        }
        Ok(())
    }

    /// Insert a started session unless its ids were taken in the meantime
    async fn register(&self, handle: SessionHandle) -> RegistryResult<()> {
        let mut sessions = self.sessions.write().await;
        let taken = if sessions.contains_key(handle.session_id()) {
            Some(RegistryError::DuplicateSession(handle.session_id().to_string()))
        } else if sessions.values().any(|s| s.node_id() == handle.node_id()) {
            Some(RegistryError::DuplicateNode(handle.node_id().to_string()))
        } else {
            None
        };
        if let Some(err) = taken {
            drop(sessions);
            handle.destroy().await;
            return Err(err);
        }
        sessions.insert(handle.session_id().to_string(), handle);
        Ok(())
    }

    /// Spawn a new session for `agent` in `cwd`
    ///
    /// On a spawn failure nothing is registered and nothing is persisted. A
    /// worktree prepared for the session stays on disk and is picked up again
    /// by the next session on that branch.
    pub async fn create(
        &self,
        agent: &AgentDefinition,
        cwd: &Path,
        options: CreateOptions,
    ) -> RegistryResult<CreatedSession> {
        if !cwd.is_dir() {
            return Err(RegistryError::InvalidPath(cwd.display().to_string()));
        }

        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let node_id = options
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.ensure_ids_free(&node_id, &session_id).await?;

        let (workdir, worktree_path) = match &options.worktree_branch {
            Some(branch) => {
                let path = self.prepare_worktree(cwd, branch).await?;
                (path.clone(), Some(path.display().to_string()))
            }
            None => (cwd.to_path_buf(), None),
        };
        let git_branch = detect_branch(&workdir).await;

        let size = options
            .size
            .unwrap_or_else(|| self.settings.session.terminal_size());
        let request = agent.spawn_request(&workdir, size);
        info!(
            "Spawning session {} ({}) in {}",
            session_id,
            request.command_line(),
            workdir.display()
        );
        let spawned = self.adapter.spawn(&request).map_err(RegistryError::Spawn)?;

        let meta = SessionMeta {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            command: request.command_line(),
            cwd: workdir.display().to_string(),
            git_branch,
            worktree_path,
            created_at: options
                .created_at
                .clone()
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            ticket_id: options.ticket.as_ref().map(|t| t.ticket_id.clone()),
            ticket_title: options.ticket.as_ref().map(|t| t.title.clone()),
            ticket_url: options.ticket.as_ref().map(|t| t.url.clone()),
        };
        let node = PersistedNode::from_session(&meta, &options.overrides, options.position);

        let handle = SessionHandle::spawn(
            meta,
            options.overrides,
            Some(spawned),
            Arc::clone(&self.detector),
            self.session_options(options.initial_prompt),
            self.event_tx.clone(),
        );
        self.register(handle).await?;

        if let Some(layout) = &self.layout {
            layout.upsert_node(node);
        }
        let _ = self.event_tx.send(SessionEvent::Created {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
        });

        debug!("Session {} created on node {}", session_id, node_id);
        Ok(CreatedSession {
            session_id,
            node_id,
        })
    }

    /// Create a session by agent id
    pub async fn create_for(
        &self,
        agent_id: &str,
        cwd: &Path,
        options: CreateOptions,
    ) -> RegistryResult<CreatedSession> {
        let agent = self
            .settings
            .find_agent(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))?;
        self.create(&agent, cwd, options).await
    }

    /// Create a session that starts working on `ticket`
    ///
    /// The rendered ticket prompt is typed into the agent after the start-up
    /// delay. With `create_worktree` enabled the session runs in a worktree on
    /// the ticket's branch.
    pub async fn create_from_ticket(
        &self,
        agent: &AgentDefinition,
        cwd: &Path,
        ticket: TicketRequest,
        mut options: CreateOptions,
    ) -> RegistryResult<CreatedSession> {
        options.initial_prompt = Some(render_prompt(
            self.settings.ticket_prompt_template(),
            &ticket,
        ));
        if self.settings.session.create_worktree && options.worktree_branch.is_none() {
            options.worktree_branch = Some(ticket.branch_name());
        }
        if options.overrides.custom_name.is_none() && !ticket.title.is_empty() {
            options.overrides.custom_name = Some(format!("{}: {}", ticket.ticket_id, ticket.title));
        }
        options.ticket = Some(ticket);
        self.create(agent, cwd, options).await
    }

    async fn prepare_worktree(&self, cwd: &Path, branch: &str) -> RegistryResult<PathBuf> {
        let cwd = cwd.to_path_buf();
        let branch = branch.to_string();
        let base = self.settings.session.default_base_branch.clone();

        let info = tokio::task::spawn_blocking(move || git::prepare_worktree(&cwd, &branch, &base))
            .await
            .map_err(|e| RegistryError::InvalidPath(format!("worktree task failed: {}", e)))??;
        info!("Using worktree {} on {}", info.path.display(), info.branch);
        Ok(info.path)
    }

    /// Destroy a session: kill its process, close its viewers and drop its
    /// node from the layout. Unknown ids are not an error.
    pub async fn destroy(&self, session_id: &str) -> RegistryResult<()> {
        let handle = self.sessions.write().await.remove(session_id);
        let Some(handle) = handle else {
            debug!("Destroy for unknown session {}", session_id);
            return Ok(());
        };

        info!("Destroying session {}", session_id);
        handle.destroy().await;

        if let Some(layout) = &self.layout {
            layout.remove_node(handle.node_id());
        }
        let _ = self.event_tx.send(SessionEvent::Destroyed {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Snapshot of one session
    pub async fn get(&self, session_id: &str) -> RegistryResult<SessionInfo> {
        let handle = self.handle(session_id).await?;
        Ok(handle.snapshot().await?)
    }

    /// Snapshots of all sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.snapshot().await {
                Ok(info) => infos.push(info),
                Err(e) => debug!("Skipping session {}: {}", handle.session_id(), e),
            }
        }
        infos.sort_by(|a, b| {
            a.meta
                .created_at
                .cmp(&b.meta.created_at)
                .then_with(|| a.meta.session_id.cmp(&b.meta.session_id))
        });
        infos
    }

    /// Attach a viewer. It first receives the session backlog.
    pub async fn subscribe(&self, session_id: &str, viewer: Viewer) -> RegistryResult<()> {
        let handle = self.handle(session_id).await?;
        handle.subscribe(viewer).await?;
        Ok(())
    }

    /// Detach a viewer. Unknown sessions and viewers are ignored.
    pub async fn unsubscribe(&self, session_id: &str, viewer_id: ViewerId) {
        if let Ok(handle) = self.handle(session_id).await {
            handle.unsubscribe(viewer_id).await;
        }
    }

    /// Write raw bytes to the session's terminal
    pub async fn input(&self, session_id: &str, data: Vec<u8>) -> RegistryResult<()> {
        let handle = self.handle(session_id).await?;
        handle.input(data).await?;
        Ok(())
    }

    /// Resize the session's terminal
    pub async fn resize(&self, session_id: &str, size: TerminalSize) -> RegistryResult<()> {
        let handle = self.handle(session_id).await?;
        handle.resize(size).await?;
        Ok(())
    }

    /// Change name, color or notes, and persist them
    pub async fn update_overrides(
        &self,
        session_id: &str,
        overrides: SessionOverrides,
    ) -> RegistryResult<SessionInfo> {
        let handle = self.handle(session_id).await?;
        let info = handle.update(overrides).await?;

        if let Some(layout) = &self.layout {
            let current = info.overrides.clone();
            layout.update_node(info.meta.node_id.clone(), move |node| {
                node.set_overrides(&current)
            });
        }
        Ok(info)
    }

    /// Replace the usage figures reported by the agent
    pub async fn set_metrics(&self, session_id: &str, metrics: AgentMetrics) -> RegistryResult<()> {
        let handle = self.handle(session_id).await?;
        handle.set_metrics(metrics).await?;
        Ok(())
    }

    async fn insert_placeholder(&self, node: &PersistedNode) -> bool {
        let handle = SessionHandle::spawn(
            node.meta(),
            node.overrides(),
            None,
            Arc::clone(&self.detector),
            self.session_options(None),
            self.event_tx.clone(),
        );
        match self.register(handle).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not restore node {}: {}", node.node_id, e);
                false
            }
        }
    }

    /// Bring back the sessions of a saved layout
    ///
    /// Nodes already owned by a live session are left alone. With
    /// `resume_on_restore` nodes of known agents get a fresh process; every
    /// other node becomes a disconnected placeholder. The restored nodes and
    /// their grid positions are then merged into the layout writer; nodes of
    /// live sessions keep their current entry.
    pub async fn restore(&self, mut layout: PersistedLayout) -> RestoreReport {
        restore::assign_positions(&mut layout.nodes, &self.settings.layout);

        let live: HashSet<String> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.node_id().to_string())
            .collect();
        let plans = restore::plan(
            &layout,
            &live,
            &self.settings.agents,
            self.settings.session.resume_on_restore,
        );

        let mut report = RestoreReport::default();
        let mut nodes = Vec::with_capacity(plans.len());
        for plan in plans {
            match &plan.action {
                RestoreAction::Attach => {
                    report.attached += 1;
                    continue;
                }
                RestoreAction::Resume(agent) => {
                    let options = CreateOptions {
                        session_id: Some(plan.node.session_id.clone()),
                        node_id: Some(plan.node.node_id.clone()),
                        overrides: plan.node.overrides(),
                        position: plan.node.position,
                        created_at: Some(plan.node.created_at.clone()),
                        ..Default::default()
                    };
                    match self.create(agent, Path::new(&plan.node.cwd), options).await {
                        // The new session recorded its own node
                        Ok(_) => {
                            report.resumed += 1;
                            continue;
                        }
                        Err(e) => {
                            warn!(
                                "Failed to resume node {}, keeping it disconnected: {}",
                                plan.node.node_id, e
                            );
                            if self.insert_placeholder(&plan.node).await {
                                report.placeholders += 1;
                            }
                        }
                    }
                }
                RestoreAction::Placeholder { orphaned } => {
                    if *orphaned {
                        warn!(
                            "Node {} refers to unknown agent {}",
                            plan.node.node_id, plan.node.agent_id
                        );
                        report.orphaned.push(plan.node.node_id.clone());
                    }
                    if self.insert_placeholder(&plan.node).await {
                        report.placeholders += 1;
                    }
                }
            }
            nodes.push(plan.node);
        }

        if let Some(writer) = &self.layout {
            writer.merge(PersistedLayout {
                nodes,
                categories: layout.categories,
            });
        }

        info!(
            "Restored layout: {} attached, {} resumed, {} placeholders ({} orphaned)",
            report.attached,
            report.resumed,
            report.placeholders,
            report.orphaned.len()
        );
        report
    }

    /// Stop every session
    ///
    /// Used during server shutdown. Saved nodes are kept so the next start can
    /// restore them.
    pub async fn shutdown_all(&self) {
        info!("Shutting down all sessions");
        let handles: Vec<SessionHandle> = self.sessions.write().await.drain().map(|(_, h)| h).collect();

        for handle in handles {
            handle.destroy().await;
        }
    }
}

async fn detect_branch(path: &Path) -> Option<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || git::current_branch(&path))
        .await
        .ok()
        .flatten()
}
