//! Canvas layout persistence
//!
//! Loads and saves the canvas layout to .agent-canvas/state.json

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::agent::{SessionMeta, SessionOverrides};
use crate::config::{Settings, STATE_FILE};

/// Errors that can occur during layout operations
#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Failed to access layout file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse layout: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Position of an element on the canvas
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Round both coordinates to the nearest multiple of `grid`
    pub fn snapped(self, grid: f64) -> Self {
        if grid <= 0.0 {
            return self;
        }
        Self {
            x: (self.x / grid).round() * grid,
            y: (self.y / grid).round() * grid,
        }
    }
}

/// A session node as saved on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNode {
    pub node_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub agent_name: String,
    pub command: String,
    pub cwd: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

impl PersistedNode {
    pub fn from_session(
        meta: &SessionMeta,
        overrides: &SessionOverrides,
        position: Option<Position>,
    ) -> Self {
        Self {
            node_id: meta.node_id.clone(),
            session_id: meta.session_id.clone(),
            agent_id: meta.agent_id.clone(),
            agent_name: meta.agent_name.clone(),
            command: meta.command.clone(),
            cwd: meta.cwd.clone(),
            created_at: meta.created_at.clone(),
            custom_name: overrides.custom_name.clone(),
            custom_color: overrides.custom_color.clone(),
            notes: overrides.notes.clone(),
            git_branch: meta.git_branch.clone(),
            worktree_path: meta.worktree_path.clone(),
            ticket_id: meta.ticket_id.clone(),
            ticket_title: meta.ticket_title.clone(),
            ticket_url: meta.ticket_url.clone(),
            position,
        }
    }

    /// Session metadata recorded for this node
    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            session_id: self.session_id.clone(),
            node_id: self.node_id.clone(),
            agent_id: self.agent_id.clone(),
            agent_name: self.agent_name.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            git_branch: self.git_branch.clone(),
            worktree_path: self.worktree_path.clone(),
            created_at: self.created_at.clone(),
            ticket_id: self.ticket_id.clone(),
            ticket_title: self.ticket_title.clone(),
            ticket_url: self.ticket_url.clone(),
        }
    }

    pub fn overrides(&self) -> SessionOverrides {
        SessionOverrides {
            custom_name: self.custom_name.clone(),
            custom_color: self.custom_color.clone(),
            notes: self.notes.clone(),
        }
    }

    pub fn set_overrides(&mut self, overrides: &SessionOverrides) {
        self.custom_name = overrides.custom_name.clone();
        self.custom_color = overrides.custom_color.clone();
        self.notes = overrides.notes.clone();
    }
}

/// A labelled grouping rectangle on the canvas
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCategory {
    pub id: String,
    pub label: String,
    pub color: String,
    pub position: Position,
    pub width: f64,
    pub height: f64,
}

/// Everything saved about the canvas
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedLayout {
    #[serde(default)]
    pub nodes: Vec<PersistedNode>,
    #[serde(default)]
    pub categories: Vec<PersistedCategory>,
}

impl PersistedLayout {
    pub fn node(&self, node_id: &str) -> Option<&PersistedNode> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut PersistedNode> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    /// Insert a node or replace the one with the same id, keeping its saved
    /// position when the new node has none
    pub fn upsert_node(&mut self, mut node: PersistedNode) {
        match self.node_mut(&node.node_id) {
            Some(existing) => {
                if node.position.is_none() {
                    node.position = existing.position;
                }
                *existing = node;
            }
            None => self.nodes.push(node),
        }
    }

    pub fn remove_node(&mut self, node_id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.node_id != node_id);
        self.nodes.len() != before
    }

    /// Apply positions by node id; unknown ids are ignored
    pub fn set_positions(&mut self, positions: &HashMap<String, Position>) {
        for node in &mut self.nodes {
            if let Some(position) = positions.get(&node.node_id) {
                node.position = Some(*position);
            }
        }
    }

    /// Fold `other` into this layout by id. Nodes and categories of `other`
    /// win; everything else is kept.
    pub fn merge(&mut self, other: PersistedLayout) {
        for node in other.nodes {
            self.upsert_node(node);
        }
        for category in other.categories {
            match self.categories.iter_mut().find(|c| c.id == category.id) {
                Some(existing) => *existing = category,
                None => self.categories.push(category),
            }
        }
    }

    /// Copy with every node and category position snapped to `grid`
    pub fn snapped(&self, grid: f64) -> Self {
        let mut layout = self.clone();
        for node in &mut layout.nodes {
            node.position = node.position.map(|p| p.snapped(grid));
        }
        for category in &mut layout.categories {
            category.position = category.position.snapped(grid);
        }
        layout
    }
}

/// Reads and writes the layout file of one project
#[derive(Debug, Clone)]
pub struct LayoutStore {
    path: PathBuf,
    grid_size: f64,
}

impl LayoutStore {
    pub fn new(path: impl Into<PathBuf>, grid_size: f64) -> Self {
        Self {
            path: path.into(),
            grid_size,
        }
    }

    /// Store for `<project>/.agent-canvas/state.json`
    pub fn for_project(project_path: &Path, grid_size: f64) -> Self {
        Self::new(Settings::state_dir(project_path).join(STATE_FILE), grid_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved layout. A missing file is an empty layout.
    pub fn load_layout(&self) -> Result<PersistedLayout, LayoutError> {
        if !self.path.exists() {
            return Ok(PersistedLayout::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let layout: PersistedLayout = serde_json::from_str(&content)?;
        Ok(layout)
    }

    /// Snap positions to the grid and replace the file atomically
    pub fn save_layout(&self, layout: &PersistedLayout) -> Result<(), LayoutError> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let content = serde_json::to_string_pretty(&layout.snapped(self.grid_size))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
