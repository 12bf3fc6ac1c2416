//! PTY management module
//!
//! Provides the process adapter contract for running agents inside a
//! pseudo-terminal. Uses portable-pty for cross-platform compatibility.

mod process;

#[cfg(test)]
pub mod fake;

pub use process::*;
