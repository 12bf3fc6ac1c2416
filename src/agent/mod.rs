//! Agent session management module
//!
//! Sessions wrap one interactive agent process each. The registry creates and
//! destroys them; every session is run by its own actor task which fans output
//! out to viewers and keeps the session status up to date.

mod broadcast;
mod registry;
mod session;
mod status;

pub use broadcast::*;
pub use registry::*;
pub use session::*;
pub use status::*;
