//! Configuration module
//!
//! Loads project settings: agent definitions, the ticket prompt template and
//! the tunables for sessions, status detection and layout persistence.

mod settings;

pub use settings::*;
