//! Per-command execution options.

use std::fmt;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a queued command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Run once and discard
    OneShot,
    /// Re-queue after each run until the run budget is spent
    Loop,
    /// Validate and print, never run
    DryRun,
    /// Print usage, never run
    Help,
}

impl RunMode {
    /// Dry-run and help commands are never queued.
    pub fn is_runnable(self) -> bool {
        matches!(self, RunMode::OneShot | RunMode::Loop)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::OneShot => write!(f, "one-shot"),
            RunMode::Loop => write!(f, "loop"),
            RunMode::DryRun => write!(f, "dry-run"),
            RunMode::Help => write!(f, "help"),
        }
    }
}

/// Granularity used when a command is split into shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ShardUnit {
    #[default]
    Class,
    Method,
}

impl fmt::Display for ShardUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardUnit::Class => write!(f, "class"),
            ShardUnit::Method => write!(f, "method"),
        }
    }
}

/// Scheduling options extracted from a command's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    pub loop_mode: bool,
    /// Minimum time between the starts of two loop iterations.
    pub min_loop_time: Duration,
    /// Maximum number of runs in loop mode; `None` loops until shutdown.
    pub max_run_count: Option<u32>,
    pub dry_run: bool,
    pub help_mode: bool,
    /// Split into this many shards on submission.
    pub shard_count: Option<u32>,
}

impl CommandOptions {
    /// Help wins over dry-run, which wins over loop.
    pub fn run_mode(&self) -> RunMode {
        if self.help_mode {
            RunMode::Help
        } else if self.dry_run {
            RunMode::DryRun
        } else if self.loop_mode {
            RunMode::Loop
        } else {
            RunMode::OneShot
        }
    }

    /// Number of executions expected, `None` for unbounded.
    pub fn expected_executions(&self) -> Option<u32> {
        if self.loop_mode { self.max_run_count } else { Some(1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_one_shot() {
        let options = CommandOptions::default();
        assert_eq!(options.run_mode(), RunMode::OneShot);
        assert_eq!(options.expected_executions(), Some(1));
    }

    #[test]
    fn test_run_mode_precedence() {
        let options = CommandOptions {
            loop_mode: true,
            dry_run: true,
            help_mode: true,
            ..Default::default()
        };
        assert_eq!(options.run_mode(), RunMode::Help);

        let options = CommandOptions {
            loop_mode: true,
            dry_run: true,
            ..Default::default()
        };
        assert_eq!(options.run_mode(), RunMode::DryRun);
    }

    #[test]
    fn test_loop_expected_executions() {
        let unbounded = CommandOptions {
            loop_mode: true,
            ..Default::default()
        };
        assert_eq!(unbounded.run_mode(), RunMode::Loop);
        assert_eq!(unbounded.expected_executions(), None);

        let bounded = CommandOptions {
            loop_mode: true,
            max_run_count: Some(3),
            ..Default::default()
        };
        assert_eq!(bounded.expected_executions(), Some(3));
    }

    #[test]
    fn test_runnable_modes() {
        assert!(RunMode::OneShot.is_runnable());
        assert!(RunMode::Loop.is_runnable());
        assert!(!RunMode::DryRun.is_runnable());
        assert!(!RunMode::Help.is_runnable());
    }
}
