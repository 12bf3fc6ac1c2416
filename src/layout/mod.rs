//! Canvas layout module
//!
//! Persists session nodes and categories, debounces writes and reconciles the
//! saved layout with live sessions on startup.

pub mod restore;
mod store;
mod writer;

pub use store::*;
pub use writer::*;
