//! Command-line interface for loganalysis.
//!
//! Provides the worker command plus task submission, inspection and
//! maintenance commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
