//! Command file reload diffing.
//!
//! Compares the queued lines of a file with the file's new content. Both
//! sides are treated as multisets of argument vectors, so a line repeated
//! twice keeps two queued commands. A queued line may stand for several
//! commands when it was split into shards.

use std::collections::HashMap;

/// Changes needed to bring the queue in line with a reloaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    /// Queued command ids whose lines disappeared, shards included.
    pub remove: Vec<u64>,
    /// New lines, in file order.
    pub add: Vec<Vec<String>>,
}

impl ReloadPlan {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

/// Diff `queued` (ids, line args) against `lines`.
///
/// Unchanged lines are left alone so their commands keep their ids and
/// queue positions.
pub fn diff_command_file(queued: &[(Vec<u64>, Vec<String>)], lines: &[Vec<String>]) -> ReloadPlan {
    let mut old: HashMap<&[String], usize> = HashMap::new();
    for (_, args) in queued {
        *old.entry(args.as_slice()).or_default() += 1;
    }
    let mut new: HashMap<&[String], usize> = HashMap::new();
    for args in lines {
        *new.entry(args.as_slice()).or_default() += 1;
    }

    let mut plan = ReloadPlan::default();
    for (ids, args) in queued {
        match new.get_mut(args.as_slice()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => plan.remove.extend(ids.iter().copied()),
        }
    }
    for args in lines {
        match old.get_mut(args.as_slice()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => plan.add.push(args.clone()),
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_unchanged_file() {
        let queued = vec![(vec![1], line("a --loop")), (vec![2], line("b"))];
        let plan = diff_command_file(&queued, &[line("a --loop"), line("b")]);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_added_and_removed_lines() {
        let queued = vec![(vec![1], line("a")), (vec![2], line("b"))];
        let plan = diff_command_file(&queued, &[line("b"), line("c")]);
        assert_eq!(plan.remove, vec![1]);
        assert_eq!(plan.add, vec![line("c")]);
    }

    #[test]
    fn test_duplicate_lines_counted() {
        let queued = vec![(vec![1], line("a")), (vec![2], line("a")), (vec![3], line("a"))];
        let plan = diff_command_file(&queued, &[line("a")]);
        assert_eq!(plan.remove, vec![2, 3]);
        assert!(plan.add.is_empty());

        let plan = diff_command_file(&[(vec![1], line("a"))], &[line("a"), line("a")]);
        assert!(plan.remove.is_empty());
        assert_eq!(plan.add, vec![line("a")]);
    }

    #[test]
    fn test_empty_queue_adds_everything() {
        let plan = diff_command_file(&[], &[line("a"), line("b")]);
        assert_eq!(plan.add, vec![line("a"), line("b")]);
    }

    #[test]
    fn test_emptied_file_removes_everything() {
        let plan = diff_command_file(&[(vec![4], line("a")), (vec![5], line("b"))], &[]);
        assert_eq!(plan.remove, vec![4, 5]);
    }

    #[test]
    fn test_sharded_line_kept_or_dropped_whole() {
        let queued = vec![(vec![2, 3], line("host --shard-count 2"))];
        let plan = diff_command_file(&queued, &[line("host --shard-count 2")]);
        assert!(plan.is_empty());

        let plan = diff_command_file(&queued, &[line("host --shard-count 3")]);
        assert_eq!(plan.remove, vec![2, 3]);
        assert_eq!(plan.add, vec![line("host --shard-count 3")]);
    }
}
