//! Project settings
//!
//! Loads settings from .agent-canvas/config.toml. Every field has a default,
//! so a missing file or a partial file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::pty::{SpawnRequest, TerminalSize};

/// Directory holding settings and saved state, relative to the launch directory
pub const CONFIG_DIR: &str = ".agent-canvas";
pub const CONFIG_FILE: &str = "config.toml";
pub const STATE_FILE: &str = "state.json";

/// Initial instruction for sessions started from a ticket
pub const DEFAULT_TICKET_PROMPT_TEMPLATE: &str = "Here is the ticket for this session: {{url}}\n\nPlease fetch the URL to read the full ticket details for {{id}} ({{title}}) before starting work.";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// An agent that sessions can be created from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    /// Stable identifier referenced by sessions and saved layouts
    pub id: String,
    /// Display name
    pub name: String,
    /// Program to run
    pub command: String,
    /// Additional command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "default_icon")]
    pub icon: String,
    /// Extra environment variables for the process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_color() -> String {
    "#888888".to_string()
}

fn default_icon() -> String {
    "cpu".to_string()
}

impl AgentDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            description: String::new(),
            color: default_color(),
            icon: default_icon(),
            env: HashMap::new(),
        }
    }

    /// Build the spawn request for running this agent in `cwd`
    pub fn spawn_request(&self, cwd: impl Into<PathBuf>, size: TerminalSize) -> SpawnRequest {
        let mut request = SpawnRequest::new(&self.command, cwd)
            .with_args(self.args.clone())
            .with_size(size);
        for (key, value) in &self.env {
            request = request.with_env(key, value);
        }
        request
    }
}

/// Agents available when the config file does not list any
pub fn default_agents() -> Vec<AgentDefinition> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());

    let mut claude = AgentDefinition::new("claude", "Claude Code", "claude");
    claude.description = "Anthropic's agentic coding CLI".to_string();
    claude.color = "#d97757".to_string();
    claude.icon = "sparkles".to_string();

    let mut opencode = AgentDefinition::new("opencode", "OpenCode", "opencode");
    opencode.description = "Open source terminal coding agent".to_string();
    opencode.color = "#22c55e".to_string();
    opencode.icon = "code".to_string();

    let mut terminal = AgentDefinition::new("shell", "Terminal", shell);
    terminal.description = "Plain interactive shell".to_string();
    terminal.icon = "terminal".to_string();

    vec![claude, opencode, terminal]
}

/// Thresholds for the output status heuristic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusThresholds {
    /// Trailing characters of output inspected for prompts and tool markers
    pub window_chars: usize,
    /// Trailing characters inspected for shell-prompt-like endings
    pub prompt_window_chars: usize,
    /// Tool markers only count while output is this recent
    pub tool_recency_ms: u64,
    /// Short burst: output this recent...
    pub burst_recency_ms: u64,
    /// ...and more than this many recent bytes
    pub burst_min_bytes: usize,
    /// Sustained stream: output this recent...
    pub stream_recency_ms: u64,
    /// ...and more than this many recent bytes
    pub stream_min_bytes: usize,
    /// Output right after typing is treated as echo, not activity
    pub typing_suppression_ms: u64,
    /// Width of the sliding window behind the recent output size
    pub recent_window_ms: u64,
    /// How often live sessions are re-classified without new output
    pub refresh_interval_ms: u64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            window_chars: 3000,
            prompt_window_chars: 150,
            tool_recency_ms: 3000,
            burst_recency_ms: 500,
            burst_min_bytes: 50,
            stream_recency_ms: 2000,
            stream_min_bytes: 100,
            typing_suppression_ms: 1000,
            recent_window_ms: 2000,
            refresh_interval_ms: 1000,
        }
    }
}

impl StatusThresholds {
    pub fn tool_recency(&self) -> Duration {
        Duration::from_millis(self.tool_recency_ms)
    }

    pub fn burst_recency(&self) -> Duration {
        Duration::from_millis(self.burst_recency_ms)
    }

    pub fn stream_recency(&self) -> Duration {
        Duration::from_millis(self.stream_recency_ms)
    }

    pub fn typing_suppression(&self) -> Duration {
        Duration::from_millis(self.typing_suppression_ms)
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_millis(self.recent_window_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Output chunks kept for replay to late viewers
    pub backlog_chunks: usize,
    /// Initial terminal columns
    pub cols: u16,
    /// Initial terminal rows
    pub rows: u16,
    /// Delay before a ticket instruction is typed into a new session
    pub initial_prompt_delay_ms: u64,
    /// Respawn saved nodes with a known agent on startup instead of showing
    /// them disconnected
    pub resume_on_restore: bool,
    /// Give each ticket session its own git worktree
    pub create_worktree: bool,
    /// Branch new ticket worktrees start from
    pub default_base_branch: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            backlog_chunks: 1000,
            cols: 80,
            rows: 24,
            initial_prompt_delay_ms: 1500,
            resume_on_restore: false,
            create_worktree: false,
            default_base_branch: "main".to_string(),
        }
    }
}

impl SessionSettings {
    pub fn terminal_size(&self) -> TerminalSize {
        TerminalSize::new(self.cols, self.rows)
    }

    pub fn initial_prompt_delay(&self) -> Duration {
        Duration::from_millis(self.initial_prompt_delay_ms)
    }
}

/// Layout persistence settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LayoutSettings {
    /// Quiet period before a layout change is written
    pub debounce_ms: u64,
    /// Positions are snapped to multiples of this
    pub grid_size: f64,
    /// Columns of the fallback grid for nodes without a position
    pub grid_columns: usize,
    pub origin_x: f64,
    pub origin_y: f64,
    pub spacing_x: f64,
    pub spacing_y: f64,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            grid_size: 24.0,
            grid_columns: 5,
            origin_x: 100.0,
            origin_y: 100.0,
            spacing_x: 220.0,
            spacing_y: 150.0,
        }
    }
}

impl LayoutSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Project settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Initial instruction for ticket sessions; `{{url}}`, `{{id}}` and
    /// `{{title}}` are substituted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_prompt_template: Option<String>,
    /// Agents sessions can be created from
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub status: StatusThresholds,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub layout: LayoutSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ticket_prompt_template: None,
            agents: default_agents(),
            status: StatusThresholds::default(),
            session: SessionSettings::default(),
            layout: LayoutSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a project directory
    pub fn load(project_path: &Path) -> Result<Self, ConfigError> {
        let config_path = project_path.join(CONFIG_DIR).join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a project directory
    pub fn save(&self, project_path: &Path) -> Result<(), ConfigError> {
        let config_dir = project_path.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    /// Get an agent definition by id
    pub fn find_agent(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Template used for ticket sessions
    pub fn ticket_prompt_template(&self) -> &str {
        self.ticket_prompt_template
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_TICKET_PROMPT_TEMPLATE)
    }

    /// Directory holding saved state for a project
    pub fn state_dir(project_path: &Path) -> PathBuf {
        project_path.join(CONFIG_DIR)
    }
}
