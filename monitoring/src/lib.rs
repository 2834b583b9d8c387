//! Logging bootstrap shared by every crate in the workspace.

pub mod logging;
