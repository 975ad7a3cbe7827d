//! Command-line interface for course-forge.
//!
//! Provides commands for building courses, recompiling single modules and
//! checking scene sources.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
