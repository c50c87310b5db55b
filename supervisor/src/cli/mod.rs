//! CLI module
//!
//! Argument definitions for the `mcp-supervisor` binary.

pub mod args;

pub use args::{Cli, Commands};
