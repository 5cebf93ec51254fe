//! Queue of commands waiting for a device.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::command::{CommandTracker, RunMode};
use crate::device::DeviceSelectionSpec;

/// A command waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub tracker: CommandTracker,
    pub selection: DeviceSelectionSpec,
    pub mode: RunMode,
    /// Minimum time between loop iteration starts.
    pub min_loop_time: Duration,
    /// Not offered for allocation before this instant.
    pub ready_at: Option<Instant>,
}

impl QueuedCommand {
    pub fn new(tracker: CommandTracker, selection: DeviceSelectionSpec, mode: RunMode) -> Self {
        Self {
            tracker,
            selection,
            mode,
            min_loop_time: Duration::ZERO,
            ready_at: None,
        }
    }

    pub fn with_min_loop_time(mut self, min_loop_time: Duration) -> Self {
        self.min_loop_time = min_loop_time;
        self
    }

    pub fn with_ready_at(mut self, ready_at: Instant) -> Self {
        self.ready_at = Some(ready_at);
        self
    }

    pub fn id(&self) -> u64 {
        self.tracker.id()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at.is_none_or(|at| at <= now)
    }
}

/// Commands not bound to a running invocation, ordered by id.
///
/// Ids are handed out in submission order, so iteration order is FIFO.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: BTreeMap<u64, QueuedCommand>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: QueuedCommand) {
        self.entries.insert(command.id(), command);
    }

    pub fn get(&self, id: u64) -> Option<&QueuedCommand> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<QueuedCommand> {
        self.entries.remove(&id)
    }

    /// Drop every queued command, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids of all queued commands, oldest first.
    pub fn ids(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.entries.values()
    }

    /// Earliest `ready_at` among commands still waiting on their loop delay.
    pub fn next_ready_at(&self, now: Instant) -> Option<Instant> {
        self.entries
            .values()
            .filter_map(|c| c.ready_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Queued commands that stand for a line of the command file at `path`,
    /// grouped per line: the ids queued for it and the line's arguments.
    ///
    /// Shards of one line form one group. Commands that merely inherited the
    /// file, such as reschedules, are not included.
    pub fn from_file(&self, path: &Path) -> Vec<(Vec<u64>, Vec<String>)> {
        let mut groups: Vec<(u64, Vec<u64>, Vec<String>)> = Vec::new();
        for command in self.entries.values() {
            if command.tracker.command_file() != Some(path) {
                continue;
            }
            let Some(line) = command.tracker.file_line() else {
                continue;
            };
            match groups.iter_mut().find(|(group, _, _)| *group == line.group) {
                Some((_, ids, _)) => ids.push(command.id()),
                None => groups.push((line.group, vec![command.id()], line.args.clone())),
            }
        }
        groups.into_iter().map(|(_, ids, args)| (ids, args)).collect()
    }

    /// Snapshot of queued trackers, oldest first.
    pub fn trackers(&self) -> Vec<CommandTracker> {
        self.entries.values().map(|c| c.tracker.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::FileLine;
    use std::path::PathBuf;

    fn command(id: u64, file: Option<&str>) -> QueuedCommand {
        let tracker = CommandTracker::new(id, vec![format!("cmd{}", id)], file.map(PathBuf::from));
        QueuedCommand::new(tracker, DeviceSelectionSpec::default(), RunMode::OneShot)
    }

    fn file_command(id: u64, file: &str, line: &str, group: u64) -> QueuedCommand {
        let tracker = CommandTracker::new(id, vec![format!("cmd{}", id)], Some(PathBuf::from(file))).with_file_line(
            FileLine {
                args: vec![line.to_string()],
                group,
            },
        );
        QueuedCommand::new(tracker, DeviceSelectionSpec::default(), RunMode::OneShot)
    }

    #[test]
    fn test_fifo_by_id() {
        let mut queue = CommandQueue::new();
        queue.push(command(3, None));
        queue.push(command(1, None));
        queue.push(command(2, None));
        assert_eq!(queue.ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut queue = CommandQueue::new();
        queue.push(command(1, None));
        queue.push(command(2, None));

        assert_eq!(queue.remove(1).map(|c| c.id()), Some(1));
        assert!(queue.remove(1).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ready_at() {
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        let mut queue = CommandQueue::new();
        queue.push(command(1, None));
        queue.push(command(2, None).with_ready_at(later));

        assert!(queue.get(1).unwrap().is_ready(now));
        assert!(!queue.get(2).unwrap().is_ready(now));
        assert!(queue.get(2).unwrap().is_ready(later));
        assert_eq!(queue.next_ready_at(now), Some(later));
    }

    #[test]
    fn test_from_file() {
        let mut queue = CommandQueue::new();
        queue.push(file_command(1, "/tmp/a.txt", "x", 1));
        queue.push(command(2, None));
        queue.push(file_command(3, "/tmp/a.txt", "y", 3));
        queue.push(file_command(4, "/tmp/b.txt", "z", 4));

        let from_a = queue.from_file(Path::new("/tmp/a.txt"));
        assert_eq!(
            from_a,
            vec![(vec![1], vec!["x".to_string()]), (vec![3], vec!["y".to_string()])]
        );
    }

    #[test]
    fn test_from_file_groups_shards() {
        let mut queue = CommandQueue::new();
        queue.push(file_command(2, "/tmp/a.txt", "host --shard-count 2", 1));
        queue.push(file_command(3, "/tmp/a.txt", "host --shard-count 2", 1));

        let from_a = queue.from_file(Path::new("/tmp/a.txt"));
        assert_eq!(from_a, vec![(vec![2, 3], vec!["host --shard-count 2".to_string()])]);
    }

    #[test]
    fn test_from_file_skips_inherited_origin() {
        let mut queue = CommandQueue::new();
        queue.push(file_command(1, "/tmp/a.txt", "x", 1));
        // a reschedule keeps the file but is not one of its lines
        queue.push(command(2, Some("/tmp/a.txt")));

        assert_eq!(queue.from_file(Path::new("/tmp/a.txt")), vec![(vec![1], vec!["x".to_string()])]);
    }
}
