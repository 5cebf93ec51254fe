//! Commands: what gets submitted and how it is interpreted.
//!
//! - **Options**: [`CommandOptions`] and the derived [`RunMode`].
//! - **Configuration**: [`ConfigurationFactory`] turns an argument vector into
//!   a fresh [`Configuration`] for every attempt.
//! - **Tracker**: [`CommandTracker`] carries a command's id and loop budget.
//! - **File**: [`CommandFileParser`] expands command files.
//! - **Split**: [`CommandSplitter`] shards multi-class commands.

mod configuration;
mod file;
mod options;
mod split;
mod tracker;

pub use configuration::{ArgsConfigurationFactory, Configuration, ConfigurationFactory, TestTarget};
pub use file::{CommandFileParser, CommandLine, ParsedCommandFile};
pub use options::{CommandOptions, RunMode, ShardUnit};
pub use split::{CommandSplitter, StaticTestCatalog, TestCatalog};
pub use tracker::{CommandTracker, FileLine};
