//! CLI module for cmdsched - command-line interface and subcommands.
//!
//! Provides the main entry point with subcommands for running commands,
//! inspecting the device inventory, previewing shards and checking
//! command files.

pub mod commands;

pub use commands::Cli;
