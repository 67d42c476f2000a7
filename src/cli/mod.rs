//! CLI module for relay - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for chatting with a
//! provider and inspecting configuration.

pub mod commands;

pub use commands::Cli;
