//! Flint Core - Shared functionality for the flint CLI
//!
//! Filesystem layout and display helpers used by every flint command.

pub mod format;
pub mod paths;

pub use paths::Paths;
