//! Git operations module
//!
//! Provides branch detection and worktree management.

mod worktree;

pub use worktree::*;
