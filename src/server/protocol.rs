//! Protocol message definitions
//!
//! Defines the message types exchanged between canvas clients and the server.
//! All messages are JSON-encoded and include version information for compatibility.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::agent::{RegistryError, SessionError, SessionInfo, SessionStatus};
use crate::config::AgentDefinition;
use crate::layout::{PersistedCategory, PersistedLayout, Position};
use crate::ticket::TicketRequest;

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum length of ids, names and other short strings
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum length of session notes
pub const MAX_NOTES_LENGTH: usize = 64 * 1024;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Protocol envelope wrapping all server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Protocol version used by the server
    pub version: u32,
    #[serde(flatten)]
    pub message: ServerMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEnvelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server envelope from JSON (primarily for testing)
    #[cfg(test)]
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// List the configured agents
    ListAgents,

    /// Start a new session
    CreateSession {
        agent_id: String,
        /// Working directory; relative paths resolve against the project
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// Start a session that works on a ticket
    StartTicket {
        agent_id: String,
        ticket: TicketRequest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<Position>,
        /// Run in a worktree on the ticket branch even if the project
        /// setting is off
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        worktree: bool,
    },

    DestroySession {
        session_id: String,
    },

    ListSessions,

    GetSession {
        session_id: String,
    },

    /// Start streaming a session's output to this connection
    Attach {
        session_id: String,
    },

    /// Stop streaming a session's output
    Detach {
        session_id: String,
    },

    /// Keystrokes for a session
    Input {
        session_id: String,
        data: String,
    },

    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Change a session's name, color or notes; empty strings clear
    UpdateSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        custom_color: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
    },

    /// Node positions by node id
    UpdatePositions {
        positions: HashMap<String, Position>,
    },

    SetCategories {
        categories: Vec<PersistedCategory>,
    },

    GetLayout,
}

fn check_name(field: &str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(ProtocolError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn check_optional_name(field: &str, value: &Option<String>) -> ProtocolResult<()> {
    match value {
        Some(value) if value.len() > MAX_NAME_LENGTH => Err(ProtocolError::ValidationError(
            format!("{} exceeds maximum length of {} characters", field, MAX_NAME_LENGTH),
        )),
        _ => Ok(()),
    }
}

fn check_cwd(cwd: &Option<String>) -> ProtocolResult<()> {
    if let Some(cwd) = cwd {
        if cwd.is_empty() {
            return Err(ProtocolError::ValidationError(
                "cwd cannot be empty when specified".to_string(),
            ));
        }
        if cwd.len() > MAX_PATH_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "cwd exceeds maximum length of {} characters",
                MAX_PATH_LENGTH
            )));
        }
    }
    Ok(())
}

fn check_cols(cols: u16) -> ProtocolResult<()> {
    if cols == 0 || cols > MAX_TERMINAL_COLS {
        return Err(ProtocolError::ValidationError(format!(
            "cols must be between 1 and {}",
            MAX_TERMINAL_COLS
        )));
    }
    Ok(())
}

fn check_rows(rows: u16) -> ProtocolResult<()> {
    if rows == 0 || rows > MAX_TERMINAL_ROWS {
        return Err(ProtocolError::ValidationError(format!(
            "rows must be between 1 and {}",
            MAX_TERMINAL_ROWS
        )));
    }
    Ok(())
}

fn check_position(position: &Position) -> ProtocolResult<()> {
    if !position.x.is_finite() || !position.y.is_finite() {
        return Err(ProtocolError::ValidationError(
            "position must be finite".to_string(),
        ));
    }
    Ok(())
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. }
            | ClientMessage::ListAgents
            | ClientMessage::ListSessions
            | ClientMessage::GetLayout => Ok(()),

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
                check_name("agent_id", agent_id)?;
                check_cwd(cwd)?;
                check_optional_name("node_id", node_id)?;
                check_optional_name("custom_name", custom_name)?;
                check_optional_name("custom_color", custom_color)?;
                if let Some(position) = position {
                    check_position(position)?;
                }
                if let Some(c) = cols {
                    check_cols(*c)?;
                }
                if let Some(r) = rows {
                    check_rows(*r)?;
                }
                Ok(())
            }

            ClientMessage::StartTicket {
                agent_id,
                ticket,
                cwd,
                node_id,
                position,
                ..
            } => {
                check_name("agent_id", agent_id)?;
                check_name("ticket_id", &ticket.ticket_id)?;
                if ticket.url.len() > MAX_PATH_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "ticket url exceeds maximum length of {} characters",
                        MAX_PATH_LENGTH
                    )));
                }
                check_cwd(cwd)?;
                check_optional_name("node_id", node_id)?;
                if let Some(position) = position {
                    check_position(position)?;
                }
                Ok(())
            }

            ClientMessage::DestroySession { session_id }
            | ClientMessage::GetSession { session_id }
            | ClientMessage::Attach { session_id }
            | ClientMessage::Detach { session_id } => check_name("session_id", session_id),

            ClientMessage::Input { session_id, data } => {
                check_name("session_id", session_id)?;
                if data.len() > MAX_INPUT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "input exceeds maximum length of {} bytes",
                        MAX_INPUT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::Resize {
                session_id,
                cols,
                rows,
            } => {
                check_name("session_id", session_id)?;
                check_cols(*cols)?;
                check_rows(*rows)
            }

            ClientMessage::UpdateSession {
                session_id,
                custom_name,
                custom_color,
                notes,
            } => {
                check_name("session_id", session_id)?;
                check_optional_name("custom_name", custom_name)?;
                check_optional_name("custom_color", custom_color)?;
                if notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LENGTH) {
                    return Err(ProtocolError::ValidationError(format!(
                        "notes exceed maximum length of {} bytes",
                        MAX_NOTES_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::UpdatePositions { positions } => {
                positions.values().try_for_each(check_position)
            }

            ClientMessage::SetCategories { categories } => {
                for category in categories {
                    check_name("category id", &category.id)?;
                    check_position(&category.position)?;
                }
                Ok(())
            }
        }
    }

    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create a CreateSession message with defaults for everything optional
    pub fn create_session(agent_id: impl Into<String>) -> Self {
        ClientMessage::CreateSession {
            agent_id: agent_id.into(),
            cwd: None,
            node_id: None,
            custom_name: None,
            custom_color: None,
            position: None,
            cols: None,
            rows: None,
        }
    }

    pub fn input(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        ClientMessage::Input {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    pub fn resize(session_id: impl Into<String>, cols: u16, rows: u16) -> Self {
        ClientMessage::Resize {
            session_id: session_id.into(),
            cols,
            rows,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong { seq: u64 },

    AgentList { agents: Vec<AgentSummary> },

    /// A session was created (sent to every connection)
    SessionCreated { session: SessionInfo },

    /// A session was destroyed (sent to every connection)
    SessionDestroyed { session_id: String },

    SessionList { sessions: Vec<SessionInfo> },

    /// Snapshot of one session
    Session { session: SessionInfo },

    /// Output of an attached session (may contain ANSI escape sequences)
    Output { session_id: String, data: String },

    /// A session changed status (sent to every connection)
    Status {
        session_id: String,
        status: SessionStatus,
    },

    /// The process of an attached session exited
    Exited {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    Layout { layout: PersistedLayout },

    /// Request succeeded without a payload
    Ok,

    /// Error response
    Error {
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Related session if applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Public description of a configured agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSummary {
    pub id: String,
    pub name: String,
    pub command: String,
    pub description: String,
    pub color: String,
    pub icon: String,
}

impl From<&AgentDefinition> for AgentSummary {
    fn from(agent: &AgentDefinition) -> Self {
        Self {
            id: agent.id.clone(),
            name: agent.name.clone(),
            command: agent.command.clone(),
            description: agent.description.clone(),
            color: agent.color.clone(),
            icon: agent.icon.clone(),
        }
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    SessionNotFound,
    UnknownAgent,
    /// Failed to spawn agent
    SpawnFailed,
    /// The node already has a session
    DuplicateNode,
    /// The session id is taken
    DuplicateSession,
    /// Invalid working directory
    InvalidPath,
    /// The session has no running process
    NotRunning,
    GitFailed,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: None,
        }
    }

    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    pub fn output(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        ServerMessage::Output {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Create an Error message for a specific session
    pub fn session_error(
        session_id: impl Into<String>,
        message: impl Into<String>,
        code: ErrorCode,
    ) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: Some(session_id.into()),
        }
    }
}

// ============================================================================
// Output decoding
// ============================================================================

/// Turns a stream of byte chunks into text without splitting UTF-8 sequences
/// that straddle chunk boundaries
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut text = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: hold it back for the next chunk
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        text
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

impl From<&RegistryError> for ErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RegistryError::UnknownAgent(_) => ErrorCode::UnknownAgent,
            RegistryError::DuplicateNode(_) => ErrorCode::DuplicateNode,
            RegistryError::DuplicateSession(_) => ErrorCode::DuplicateSession,
            RegistryError::InvalidPath(_) => ErrorCode::InvalidPath,
            RegistryError::Spawn(_) => ErrorCode::SpawnFailed,
            RegistryError::Git(_) => ErrorCode::GitFailed,
            RegistryError::Session(SessionError::NotRunning) => ErrorCode::NotRunning,
            RegistryError::Session(SessionError::Closed(_)) => ErrorCode::SessionNotFound,
            RegistryError::Session(SessionError::Pty(_)) => ErrorCode::InternalError,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ping_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_create_session_serialization() {
        let msg = ClientMessage::create_session("claude");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"create_session","agent_id":"claude"}"#);
    }

    #[test]
    fn test_parse_full_create_session() {
        let json = r#"{"type": "create_session", "agent_id": "claude", "cwd": "sub",
            "node_id": "n1", "custom_name": "Lead", "position": {"x": 10, "y": 20},
            "cols": 120, "rows": 40}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::CreateSession {
                agent_id,
                cwd,
                node_id,
                position,
                cols,
                ..
            } => {
                assert_eq!(agent_id, "claude");
                assert_eq!(cwd.as_deref(), Some("sub"));
                assert_eq!(node_id.as_deref(), Some("n1"));
                assert_eq!(position, Some(Position::new(10.0, 20.0)));
                assert_eq!(cols, Some(120));
            }
            _ => panic!("Expected CreateSession"),
        }
    }

    #[test]
    fn test_parse_start_ticket() {
        let json = r#"{"type": "start_ticket", "agent_id": "claude",
            "ticket": {"ticketId": "ENG-1", "title": "Fix it", "url": "https://t/ENG-1"}}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(msg.validate().is_ok());
        match msg {
            ClientMessage::StartTicket { ticket, worktree, .. } => {
                assert_eq!(ticket.ticket_id, "ENG-1");
                assert!(!worktree);
            }
            _ => panic!("Expected StartTicket"),
        }
    }

    #[test]
    fn test_input_and_resize_serialization() {
        let msg = ClientMessage::input("s1", "ls\r");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"input\""));
        assert_eq!(serde_json::from_str::<ClientMessage>(&json).unwrap(), msg);

        let msg = ClientMessage::resize("s1", 120, 40);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"cols\":120"));
        assert!(json.contains("\"rows\":40"));
    }

    #[test]
    fn test_unit_messages() {
        for (msg, tag) in [
            (ClientMessage::ListAgents, "list_agents"),
            (ClientMessage::ListSessions, "list_sessions"),
            (ClientMessage::GetLayout, "get_layout"),
        ] {
            let json = serde_json::to_string(&msg).unwrap();
            assert_eq!(json, format!(r#"{{"type":"{}"}}"#, tag));
        }
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_welcome_serialization() {
        let msg = ServerMessage::welcome();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_output_serialization() {
        let msg = ServerMessage::output("s1", "Hello, World!\n");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"output\""));
        assert!(json.contains("\"data\":\"Hello, World!\\n\""));
    }

    #[test]
    fn test_status_serialization() {
        let msg = ServerMessage::Status {
            session_id: "s1".to_string(),
            status: SessionStatus::ToolCalling,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"status\":\"tool_calling\""));
    }

    #[test]
    fn test_ok_and_error_serialization() {
        assert_eq!(serde_json::to_string(&ServerMessage::Ok).unwrap(), r#"{"type":"ok"}"#);

        let msg = ServerMessage::session_error("s1", "gone", ErrorCode::SessionNotFound);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"session_not_found\""));
        assert!(json.contains("\"session_id\":\"s1\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_agent_summary_hides_env() {
        let mut agent = AgentDefinition::new("claude", "Claude Code", "claude");
        agent.env.insert("API_KEY".to_string(), "secret".to_string());
        let msg = ServerMessage::AgentList {
            agents: vec![AgentSummary::from(&agent)],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"agent_list\""));
        assert!(!json.contains("secret"));
    }

    // -------------------------------------------------------------------------
    // Envelope Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_client_envelope_serialization() {
        let envelope = ClientEnvelope::new(ClientMessage::ping(1));
        let json = envelope.to_json().unwrap();
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"type\":\"ping\""));

        let parsed = ClientEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_client_envelope_default_version() {
        let parsed = ClientEnvelope::from_json(r#"{"type": "list_sessions"}"#).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.message, ClientMessage::ListSessions);
    }

    #[test]
    fn test_server_envelope_serialization() {
        let envelope = ServerEnvelope::new(ServerMessage::pong(1));
        let json = envelope.to_json().unwrap();
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"type\":\"pong\""));

        let parsed = ServerEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.message, ServerMessage::pong(1));
    }

    #[test]
    fn test_envelope_version_validation() {
        let json = r#"{"version": 0, "type": "ping", "seq": 1}"#;
        let result = ClientEnvelope::from_json(json);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not supported"));
    }

    // -------------------------------------------------------------------------
    // Validation Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_create_session_validation() {
        let msg = ClientMessage::create_session("");
        assert!(msg
            .validate()
            .unwrap_err()
            .to_string()
            .contains("agent_id cannot be empty"));

        let msg = ClientMessage::CreateSession {
            agent_id: "claude".to_string(),
            cwd: Some(String::new()),
            node_id: None,
            custom_name: None,
            custom_color: None,
            position: None,
            cols: None,
            rows: None,
        };
        assert!(msg.validate().unwrap_err().to_string().contains("cwd"));

        let msg = ClientMessage::CreateSession {
            agent_id: "claude".to_string(),
            cwd: None,
            node_id: None,
            custom_name: None,
            custom_color: None,
            position: Some(Position::new(f64::NAN, 0.0)),
            cols: None,
            rows: None,
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_resize_validation() {
        let result = ClientMessage::resize("s1", 0, 24).validate();
        assert!(result.unwrap_err().to_string().contains("cols must be"));

        let result = ClientMessage::resize("s1", 80, 0).validate();
        assert!(result.unwrap_err().to_string().contains("rows must be"));

        assert!(ClientMessage::resize("s1", MAX_TERMINAL_COLS + 1, 24)
            .validate()
            .is_err());
    }

    #[test]
    fn test_input_max_length() {
        let large_input = "x".repeat(MAX_INPUT_LENGTH + 1);
        let result = ClientMessage::input("s1", large_input).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_valid_messages_pass_validation() {
        assert!(ClientMessage::ping(1).validate().is_ok());
        assert!(ClientMessage::create_session("claude").validate().is_ok());
        assert!(ClientMessage::input("s1", "hello").validate().is_ok());
        assert!(ClientMessage::resize("s1", 80, 24).validate().is_ok());
        assert!(ClientMessage::ListAgents.validate().is_ok());
        assert!(ClientMessage::UpdatePositions {
            positions: HashMap::from([("n1".to_string(), Position::new(24.0, 48.0))]),
        }
        .validate()
        .is_ok());
    }

    // -------------------------------------------------------------------------
    // Output Decoding Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_decoder_joins_split_characters() {
        let bytes = "héllo ✓".as_bytes();
        let split = bytes.len() - 2;
        let mut decoder = OutputDecoder::new();

        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..split]);
        let third = decoder.decode(&bytes[split..]);

        assert_eq!(first, "h");
        assert_eq!(format!("{first}{second}{third}"), "héllo ✓");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }

    #[test]
    fn test_decoder_keeps_split_character_after_invalid_byte() {
        let mut decoder = OutputDecoder::new();
        assert_eq!(decoder.decode(b"\xffa\xe2\x82"), "\u{fffd}a");
        assert_eq!(decoder.decode(b"\xac"), "\u{20ac}");
        assert_eq!(decoder.decode(b"\xe2\x28ok"), "\u{fffd}(ok");
    }

    // -------------------------------------------------------------------------
    // Error Conversion Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_protocol_error_to_server_message() {
        let err = ProtocolError::ValidationError("test error".to_string());
        let msg: ServerMessage = err.into();

        match msg {
            ServerMessage::Error { message, code, .. } => {
                assert!(message.contains("test error"));
                assert_eq!(code, Some(ErrorCode::InvalidMessage));
            }
            _ => panic!("Expected Error message"),
        }
    }

    #[test]
    fn test_registry_error_codes() {
        let err = RegistryError::SessionNotFound("s1".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::SessionNotFound);

        let err = RegistryError::Session(SessionError::NotRunning);
        assert_eq!(ErrorCode::from(&err), ErrorCode::NotRunning);

        let err = RegistryError::DuplicateSession("s1".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::DuplicateSession);
    }
}
