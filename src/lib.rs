//! Agent Canvas
//!
//! Runs several interactive coding agents side by side, each in its own
//! pseudo-terminal, streams their output to any number of viewers, classifies
//! what each agent is doing and remembers the canvas layout across restarts.

pub mod agent;
pub mod config;
pub mod git;
pub mod layout;
pub mod pty;
pub mod server;
pub mod ticket;
