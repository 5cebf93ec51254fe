//! Command splitting (sharding).
//!
//! A command that targets several test classes can be split into independent
//! commands. With [`ShardUnit::Class`] every qualifying class becomes its own
//! shard and the requested count is ignored. With [`ShardUnit::Method`] the
//! filtered test cases are dealt out in contiguous runs, the first
//! `total % shards` shards taking one extra case.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::command::configuration::{Configuration, ConfigurationFactory};
use crate::command::options::ShardUnit;
use crate::command::tracker::CommandTracker;
use crate::error::Result;
use crate::id::CommandIdGenerator;

/// Source of test method names per class.
pub trait TestCatalog: Send + Sync {
    /// Test methods of `class` in declaration order; empty when unknown.
    fn test_methods(&self, class: &str) -> Vec<String>;
}

/// In-memory catalog, typically loaded from the scheduler config.
#[derive(Debug, Clone, Default)]
pub struct StaticTestCatalog {
    classes: BTreeMap<String, Vec<String>>,
}

impl StaticTestCatalog {
    pub fn new(classes: BTreeMap<String, Vec<String>>) -> Self {
        Self { classes }
    }

    pub fn with_class(mut self, class: impl Into<String>, methods: &[&str]) -> Self {
        self.classes
            .insert(class.into(), methods.iter().map(|m| m.to_string()).collect());
        self
    }
}

impl TestCatalog for StaticTestCatalog {
    fn test_methods(&self, class: &str) -> Vec<String> {
        self.classes.get(class).cloned().unwrap_or_default()
    }
}

/// One test case after filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TestCase {
    class: String,
    method: String,
}

impl TestCase {
    fn filter_key(&self) -> String {
        format!("{}#{}", self.class, self.method)
    }
}

/// Splits commands into shard commands.
pub struct CommandSplitter {
    factory: Arc<dyn ConfigurationFactory>,
    catalog: Arc<dyn TestCatalog>,
    ids: Arc<CommandIdGenerator>,
}

impl CommandSplitter {
    pub fn new(
        factory: Arc<dyn ConfigurationFactory>,
        catalog: Arc<dyn TestCatalog>,
        ids: Arc<CommandIdGenerator>,
    ) -> Self {
        Self { factory, catalog, ids }
    }

    /// Split `tracker` into shards.
    ///
    /// Returns `Ok(None)` when the command is not shardable: fewer than two
    /// target classes, or a method restriction across several classes.
    pub fn split(&self, desired: u32, tracker: &CommandTracker) -> Result<Option<Vec<CommandTracker>>> {
        let config = self.factory.create_configuration_from_args(tracker.args())?;
        let target = &config.test_target;

        if target.classes.len() < 2 {
            tracing::debug!(command_id = tracker.id(), "Single target class, not shardable");
            return Ok(None);
        }
        if target.method.is_some() {
            tracing::warn!(
                command_id = tracker.id(),
                "Method filter combined with several classes, not shardable"
            );
            return Ok(None);
        }
        if desired == 0 {
            return Ok(None);
        }

        let shard_configs = match target.shard_unit {
            ShardUnit::Class => self.split_by_class(&config),
            ShardUnit::Method => self.split_by_method(&config, desired as usize),
        };

        let shards: Vec<CommandTracker> = shard_configs
            .iter()
            .map(|shard| {
                let split = CommandTracker::new(
                    self.ids.next_id(),
                    shard.to_args(),
                    tracker.command_file().map(|p| p.to_path_buf()),
                )
                .with_expected_executions(tracker.expected_executions());
                match tracker.file_line() {
                    Some(line) => split.with_file_line(line.clone()),
                    None => split,
                }
            })
            .collect();

        tracing::info!(
            command_id = tracker.id(),
            unit = %target.shard_unit,
            shards = shards.len(),
            "Split command"
        );
        Ok(Some(shards))
    }

    fn cases(&self, config: &Configuration) -> Vec<TestCase> {
        let target = &config.test_target;
        let included = |case: &TestCase| {
            target.include_filters.is_empty()
                || target.include_filters.iter().any(|f| *f == case.class || *f == case.filter_key())
        };
        let excluded = |case: &TestCase| {
            target
                .exclude_filters
                .iter()
                .any(|f| *f == case.class || *f == case.filter_key())
        };

        target
            .classes
            .iter()
            .flat_map(|class| {
                self.catalog.test_methods(class).into_iter().map(move |method| TestCase {
                    class: class.clone(),
                    method,
                })
            })
            .filter(|case| included(case) && !excluded(case))
            .collect()
    }

    fn split_by_class(&self, config: &Configuration) -> Vec<Configuration> {
        let cases = self.cases(config);
        let total = cases.len();
        let hint = config.test_target.runtime_hint;

        config
            .test_target
            .classes
            .iter()
            .map(|class| {
                let count = cases.iter().filter(|c| &c.class == class).count();
                let mut shard = shard_base(config);
                shard.test_target.classes = vec![class.clone()];
                shard.test_target.runtime_hint = proportional(hint, count, total);
                shard
            })
            .collect()
    }

    fn split_by_method(&self, config: &Configuration, desired: usize) -> Vec<Configuration> {
        let cases = self.cases(config);
        let total = cases.len();

        if total == 0 {
            // fully filtered: keep the shard count, every shard runs nothing
            return (0..desired)
                .map(|_| {
                    let mut shard = shard_base(config);
                    shard.test_target.runtime_hint = Duration::ZERO;
                    shard
                })
                .collect();
        }

        let count = desired.min(total);
        let base = total / count;
        let remainder = total % count;
        let hint = config.test_target.runtime_hint;

        let mut shards = Vec::with_capacity(count);
        let mut rest = cases.as_slice();
        for index in 0..count {
            let size = base + usize::from(index < remainder);
            let (chunk, tail) = rest.split_at(size);
            rest = tail;

            let mut shard = shard_base(config);
            let target = &mut shard.test_target;
            target.classes = Vec::new();
            for case in chunk {
                if !target.classes.contains(&case.class) {
                    target.classes.push(case.class.clone());
                }
            }
            target.include_filters = chunk.iter().map(TestCase::filter_key).collect();
            target.exclude_filters = Vec::new();
            target.runtime_hint = proportional(hint, size, total);
            shards.push(shard);
        }
        shards
    }
}

/// Copy of `config` that will not be split again.
fn shard_base(config: &Configuration) -> Configuration {
    let mut shard = config.clone();
    shard.command_options.shard_count = None;
    shard
}

fn proportional(hint: Duration, part: usize, total: usize) -> Duration {
    if total == 0 {
        return Duration::ZERO;
    }
    let millis = hint.as_millis() * part as u128 / total as u128;
    Duration::from_millis(millis as u64)
}
