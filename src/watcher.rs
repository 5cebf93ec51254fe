//! Command file watcher.
//!
//! Polls the command files a scheduler has registered for reload and calls
//! [`CommandScheduler::notify_file_changed`] when their content changes.
//! Changes are detected by a SHA-256 digest over the file and everything it
//! includes, so touching a file without editing it does nothing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::scheduler::{CommandScheduler, WatchedCommandFile};

/// Digest of a command file and its includes. Unreadable files hash as
/// empty so a deleted include still registers as a change.
pub fn digest_files<'a>(files: impl IntoIterator<Item = &'a Path>) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if let Ok(content) = std::fs::read(file) {
            hasher.update(&content);
        }
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Polls watched command files on an interval.
pub struct CommandFileWatcher {
    scheduler: Weak<CommandScheduler>,
    interval: Duration,
    digests: HashMap<PathBuf, String>,
}

impl CommandFileWatcher {
    pub fn new(scheduler: &Arc<CommandScheduler>, interval: Duration) -> Self {
        Self {
            scheduler: Arc::downgrade(scheduler),
            interval,
            digests: HashMap::new(),
        }
    }

    /// Check every watched file once, returning the files that changed.
    ///
    /// A file seen for the first time is recorded, not reported.
    pub fn check_once(&mut self) -> Vec<PathBuf> {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for watched in scheduler.watched_command_files() {
            if self.record(&watched) {
                changed.push(watched.path.clone());
                tracing::info!(path = %watched.path.display(), "Command file changed");
                if let Err(e) = scheduler.notify_file_changed(&watched.path, &watched.extra_args) {
                    tracing::warn!(path = %watched.path.display(), error = %e, "Command file reload failed");
                }
            }
        }
        changed
    }

    /// Store the current digest; true when it differs from a previous one.
    fn record(&mut self, watched: &WatchedCommandFile) -> bool {
        let digest = digest_files(watched.files());
        match self.digests.insert(watched.path.clone(), digest.clone()) {
            Some(previous) => previous != digest,
            None => false,
        }
    }

    /// Poll until the scheduler shuts down or is dropped.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                match self.scheduler.upgrade() {
                    Some(scheduler) if !scheduler.is_shutdown() => {}
                    _ => break,
                }
                self.check_once();
            }
            tracing::debug!("Command file watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ArgsConfigurationFactory, Configuration};
    use crate::device::{Device, DevicePool};
    use crate::error::InvocationError;
    use crate::invocation::{Invocation, Rescheduler};
    use crate::scheduler::CommandSchedulerConfig;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopInvocation;

    #[async_trait]
    impl Invocation for NoopInvocation {
        async fn invoke(
            &self,
            _device: &mut Device,
            _config: &Configuration,
            _rescheduler: &Rescheduler,
        ) -> Result<(), InvocationError> {
            Ok(())
        }
    }

    fn scheduler() -> Arc<CommandScheduler> {
        let pool = Arc::new(DevicePool::new());
        Arc::new(
            CommandScheduler::new(pool, Arc::new(ArgsConfigurationFactory::new()), Arc::new(NoopInvocation))
                .with_config(CommandSchedulerConfig::default().with_command_file_reload(true)),
        )
    }

    #[test]
    fn test_digest_changes_with_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a\n").unwrap();
        let first = digest_files([path.as_path()]);
        assert_eq!(first.len(), 64);
        assert_eq!(first, digest_files([path.as_path()]));

        std::fs::write(&path, "b\n").unwrap();
        assert_ne!(first, digest_files([path.as_path()]));
    }

    #[test]
    fn test_check_once_reloads_changed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a --loop\n").unwrap();

        let scheduler = scheduler();
        scheduler.add_command_file(&path, &[]).unwrap();
        let mut watcher = CommandFileWatcher::new(&scheduler, Duration::from_millis(10));

        assert!(watcher.check_once().is_empty());
        assert!(watcher.check_once().is_empty());

        std::fs::write(&path, "a --loop\nb --loop\n").unwrap();
        assert_eq!(watcher.check_once(), vec![path.clone()]);
        assert_eq!(scheduler.queued_count(), 2);
    }

    #[test]
    fn test_included_file_change_detected() {
        let dir = TempDir::new().unwrap();
        let inner = dir.path().join("inner.txt");
        let outer = dir.path().join("outer.txt");
        std::fs::write(&inner, "a\n").unwrap();
        std::fs::write(&outer, "INCLUDE inner.txt\n").unwrap();

        let scheduler = scheduler();
        scheduler.add_command_file(&outer, &[]).unwrap();
        let mut watcher = CommandFileWatcher::new(&scheduler, Duration::from_millis(10));
        watcher.check_once();

        std::fs::write(&inner, "a\nb\n").unwrap();
        assert_eq!(watcher.check_once(), vec![outer]);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let scheduler = scheduler();
        let handle = CommandFileWatcher::new(&scheduler, Duration::from_millis(5)).spawn();
        scheduler.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
