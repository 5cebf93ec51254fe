//! Command tracker: identity and bookkeeping for one submitted command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The command file line a command was queued from.
///
/// Shards of one line share the line's `group`, the id of the unsplit
/// command, so a reload can keep or drop them together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileLine {
    pub args: Vec<String>,
    pub group: u64,
}

/// One submitted argument vector.
///
/// The id and arguments never change; the counters track loop-mode progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandTracker {
    id: u64,
    args: Vec<String>,
    command_file: Option<PathBuf>,
    file_line: Option<FileLine>,
    submitted_at: DateTime<Utc>,
    expected_executions: Option<u32>,
    executions: u32,
    total_exec_time: Duration,
}

impl CommandTracker {
    pub fn new(id: u64, args: Vec<String>, command_file: Option<PathBuf>) -> Self {
        Self {
            id,
            args,
            command_file,
            file_line: None,
            submitted_at: Utc::now(),
            expected_executions: Some(1),
            executions: 0,
            total_exec_time: Duration::ZERO,
        }
    }

    /// Set the run budget; `None` means unbounded.
    pub fn with_expected_executions(mut self, expected: Option<u32>) -> Self {
        self.expected_executions = expected;
        self
    }

    /// Mark this command as queued from a command file line.
    pub fn with_file_line(mut self, file_line: FileLine) -> Self {
        self.file_line = Some(file_line);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn command_file(&self) -> Option<&Path> {
        self.command_file.as_deref()
    }

    /// Set only for commands a command file reload is responsible for.
    pub fn file_line(&self) -> Option<&FileLine> {
        self.file_line.as_ref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn expected_executions(&self) -> Option<u32> {
        self.expected_executions
    }

    pub fn executions(&self) -> u32 {
        self.executions
    }

    pub fn total_exec_time(&self) -> Duration {
        self.total_exec_time
    }

    /// Record one finished run.
    pub fn record_execution(&mut self, elapsed: Duration) {
        self.executions += 1;
        self.total_exec_time += elapsed;
    }

    /// Whether the run budget allows another execution.
    pub fn has_remaining_executions(&self) -> bool {
        self.expected_executions.is_none_or(|expected| self.executions < expected)
    }

    /// Arguments joined for display.
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}
