//! Meshmon CLI
//!
//! Argument parsing, configuration loading, snapshot persistence and the
//! command implementations behind the `meshmon` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod state;
