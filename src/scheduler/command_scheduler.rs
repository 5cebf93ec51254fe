//! Command scheduler.
//!
//! The scheduler runs a single allocation loop that:
//! 1. Applies events reported by running invocations
//! 2. Scans the queue oldest first and claims a matching device per command
//! 3. Spawns each match as its own invocation task
//! 4. Waits for an event, a freed device, new work or the poll interval
//!
//! Only the loop and the public submission methods touch the queue, always
//! under the queue lock. Invocation tasks talk back through
//! [`SchedulerEvent`]s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command::{
    CommandFileParser, CommandSplitter, CommandTracker, ConfigurationFactory, FileLine, RunMode, StaticTestCatalog,
    TestCatalog,
};
use crate::device::{DeviceLease, DevicePool, DeviceSelectionSpec, FreeDeviceState};
use crate::error::{Result, SchedulerError};
use crate::id::CommandIdGenerator;
use crate::invocation::{
    Invocation, InvocationExecutor, InvocationListener, InvocationOutcome, LoggingFailureHandler, Rescheduler,
    TerribleFailureHandler,
};
use crate::scheduler::event::SchedulerEvent;
use crate::scheduler::pacing::LoopPacing;
use crate::scheduler::queue::{CommandQueue, QueuedCommand};
use crate::scheduler::reload::diff_command_file;

/// Configuration for the CommandScheduler.
#[derive(Debug, Clone)]
pub struct CommandSchedulerConfig {
    /// Longest wait between two allocation scans.
    pub poll_interval: Duration,
    /// Watch command files for changes.
    pub command_file_reload: bool,
    /// Loop delay for loop-mode commands that do not set one.
    pub default_min_loop_time: Duration,
    /// Cap on concurrently running invocations.
    pub max_concurrent_invocations: Option<usize>,
}

impl Default for CommandSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            command_file_reload: false,
            default_min_loop_time: Duration::ZERO,
            max_concurrent_invocations: None,
        }
    }
}

impl CommandSchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_command_file_reload(mut self, enabled: bool) -> Self {
        self.command_file_reload = enabled;
        self
    }

    pub fn with_default_min_loop_time(mut self, min_loop_time: Duration) -> Self {
        self.default_min_loop_time = min_loop_time;
        self
    }

    pub fn with_max_concurrent_invocations(mut self, max: usize) -> Self {
        self.max_concurrent_invocations = Some(max);
        self
    }
}

/// A command file registered for reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchedCommandFile {
    pub path: PathBuf,
    pub extra_args: Vec<String>,
    /// Files pulled in through `INCLUDE`.
    pub included_files: Vec<PathBuf>,
}

impl WatchedCommandFile {
    /// The command file and everything it includes.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path()).chain(self.included_files.iter().map(PathBuf::as_path))
    }
}

/// Where a submitted command came from.
enum Origin {
    Direct,
    /// A line of a command file; reloads of the file manage it.
    FileLine(PathBuf),
    /// Queued by a running invocation. It keeps the parent's file for
    /// display but is not one of the file's lines.
    Reschedule {
        command_file: Option<PathBuf>,
        selection: DeviceSelectionSpec,
    },
}

/// Schedules submitted commands onto devices from a [`DevicePool`].
pub struct CommandScheduler {
    config: CommandSchedulerConfig,
    pool: Arc<DevicePool>,
    factory: Arc<dyn ConfigurationFactory>,
    executor: InvocationExecutor,
    listeners: Vec<Arc<dyn InvocationListener>>,
    failure_handler: Arc<dyn TerribleFailureHandler>,
    splitter: CommandSplitter,
    parser: CommandFileParser,
    ids: Arc<CommandIdGenerator>,
    queue: Mutex<CommandQueue>,
    running: Mutex<BTreeMap<u64, CommandTracker>>,
    watched: Mutex<BTreeMap<PathBuf, WatchedCommandFile>>,
    reload_enabled: AtomicBool,
    in_flight: AtomicUsize,
    started: AtomicBool,
    shutdown: AtomicBool,
    shutdown_on_empty: AtomicBool,
    wake: Notify,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    stopped: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CommandScheduler {
    /// Create a scheduler over `pool`. Call [`CommandScheduler::start`] to
    /// begin allocating.
    pub fn new(
        pool: Arc<DevicePool>,
        factory: Arc<dyn ConfigurationFactory>,
        invocation: Arc<dyn Invocation>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stopped, _) = watch::channel(false);
        let ids = Arc::new(CommandIdGenerator::new());
        let config = CommandSchedulerConfig::default();

        Self {
            reload_enabled: AtomicBool::new(config.command_file_reload),
            config,
            executor: InvocationExecutor::new(Arc::clone(&factory), invocation),
            splitter: CommandSplitter::new(
                Arc::clone(&factory),
                Arc::new(StaticTestCatalog::default()),
                Arc::clone(&ids),
            ),
            pool,
            factory,
            listeners: Vec::new(),
            failure_handler: Arc::new(LoggingFailureHandler),
            parser: CommandFileParser::new(),
            ids,
            queue: Mutex::new(CommandQueue::new()),
            running: Mutex::new(BTreeMap::new()),
            watched: Mutex::new(BTreeMap::new()),
            in_flight: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_on_empty: AtomicBool::new(false),
            wake: Notify::new(),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            stopped,
            loop_handle: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: CommandSchedulerConfig) -> Self {
        self.reload_enabled = AtomicBool::new(config.command_file_reload);
        self.config = config;
        self
    }

    /// Listener notified for every scheduled invocation.
    pub fn with_listener(mut self, listener: Arc<dyn InvocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_failure_handler(mut self, handler: Arc<dyn TerribleFailureHandler>) -> Self {
        self.failure_handler = handler;
        self
    }

    /// Catalog used to split `--shard-count` commands.
    pub fn with_test_catalog(mut self, catalog: Arc<dyn TestCatalog>) -> Self {
        self.splitter = CommandSplitter::new(Arc::clone(&self.factory), catalog, Arc::clone(&self.ids));
        self
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    pub fn config(&self) -> &CommandSchedulerConfig {
        &self.config
    }

    /// Spawn the allocation loop.
    pub fn start(self: &Arc<Self>) {
        let Some(events) = lock(&self.event_rx).take() else {
            tracing::warn!("Command scheduler already started");
            return;
        };
        self.started.store(true, Ordering::SeqCst);

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run_loop(events).await });
        *lock(&self.loop_handle) = Some(handle);
    }

    /// Submit a command.
    ///
    /// Returns `Ok(false)` without queueing for help and dry-run commands,
    /// and once the scheduler is shutting down.
    pub fn add_command(&self, args: Vec<String>) -> Result<bool> {
        self.add_command_from(args, Origin::Direct)
    }

    fn add_command_from(&self, args: Vec<String>, origin: Origin) -> Result<bool> {
        if self.is_shutdown() {
            tracing::warn!(args = ?args, "Scheduler shutting down, command rejected");
            return Ok(false);
        }
        let Some(commands) = self.prepare_command(args, origin)? else {
            return Ok(false);
        };

        let mut queue = lock(&self.queue);
        for command in commands {
            tracing::info!(
                command_id = command.id(),
                mode = %command.mode,
                args = %command.tracker.command_line(),
                "Command queued"
            );
            queue.push(command);
        }
        drop(queue);
        self.wake.notify_one();
        Ok(true)
    }

    /// Parse `args` into queue entries, splitting into shards when asked.
    ///
    /// `Ok(None)` for help and dry-run commands, which are printed instead.
    /// Shards of a command file line all carry that line.
    fn prepare_command(&self, args: Vec<String>, origin: Origin) -> Result<Option<Vec<QueuedCommand>>> {
        let config = self.factory.create_configuration_from_args(&args)?;
        let options = &config.command_options;
        let mode = options.run_mode();
        match mode {
            RunMode::Help => {
                self.factory.print_help(&args);
                return Ok(None);
            }
            RunMode::DryRun => {
                self.factory.print_dry_run(&config);
                return Ok(None);
            }
            RunMode::OneShot | RunMode::Loop => {}
        }

        let min_loop_time = if options.min_loop_time.is_zero() {
            self.config.default_min_loop_time
        } else {
            options.min_loop_time
        };
        let (command_file, selection, from_file) = match origin {
            Origin::Direct => (None, config.device_requirements.clone(), false),
            Origin::FileLine(path) => (Some(path), config.device_requirements.clone(), true),
            Origin::Reschedule {
                command_file,
                selection,
            } => (command_file, selection, false),
        };
        let id = self.ids.next_id();
        let mut tracker = CommandTracker::new(id, args.clone(), command_file)
            .with_expected_executions(options.expected_executions());
        if from_file {
            tracker = tracker.with_file_line(FileLine { args, group: id });
        }

        let trackers = match options.shard_count {
            Some(count) => self.splitter.split(count, &tracker)?.unwrap_or_else(|| vec![tracker]),
            None => vec![tracker],
        };

        Ok(Some(
            trackers
                .into_iter()
                .map(|tracker| QueuedCommand::new(tracker, selection.clone(), mode).with_min_loop_time(min_loop_time))
                .collect(),
        ))
    }

    /// Queue every command in a command file, each with `extra_args`
    /// appended.
    ///
    /// Lines that fail to parse are reported to the listeners and skipped.
    /// With reload enabled the file is registered for watching; adding a
    /// file that is already watched does nothing. Returns the number of
    /// lines queued.
    pub fn add_command_file(&self, path: impl AsRef<Path>, extra_args: &[String]) -> Result<usize> {
        let path = path.as_ref().to_path_buf();
        if lock(&self.watched).contains_key(&path) {
            tracing::warn!(path = %path.display(), "Command file already watched, ignoring");
            return Ok(0);
        }

        let parsed = self.parser.parse_file(&path)?;
        let mut added = 0;
        for line in &parsed.commands {
            let args = with_extra(&line.args, extra_args);
            match self.add_command_from(args.clone(), Origin::FileLine(path.clone())) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(SchedulerError::Configuration(e)) => {
                    tracing::warn!(
                        file = %line.file.display(),
                        line = line.line_number,
                        error = %e,
                        "Skipping command file entry"
                    );
                    self.report_failed(&args, &e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if self.reload_enabled.load(Ordering::SeqCst) {
            lock(&self.watched).insert(
                path.clone(),
                WatchedCommandFile {
                    path: path.clone(),
                    extra_args: extra_args.to_vec(),
                    included_files: parsed.included_files,
                },
            );
        }
        tracing::info!(path = %path.display(), commands = added, "Command file loaded");
        Ok(added)
    }

    /// Re-read a changed command file and bring the queue in line with it.
    ///
    /// Only queued lines of `path` are compared; running commands and
    /// reschedules are left alone. Unchanged lines keep their ids and queue
    /// positions, shards included.
    pub fn notify_file_changed(&self, path: &Path, extra_args: &[String]) -> Result<()> {
        let parsed = self.parser.parse_file(path)?;
        let lines: Vec<Vec<String>> = parsed
            .commands
            .iter()
            .map(|line| with_extra(&line.args, extra_args))
            .collect();

        let mut queue = lock(&self.queue);
        let plan = diff_command_file(&queue.from_file(path), &lines);
        if plan.is_empty() {
            drop(queue);
            self.update_watched(path, extra_args, parsed.included_files);
            tracing::debug!(path = %path.display(), "Command file unchanged");
            return Ok(());
        }
        for id in &plan.remove {
            queue.remove(*id);
        }
        let mut added = 0;
        for args in plan.add {
            match self.prepare_command(args.clone(), Origin::FileLine(path.to_path_buf())) {
                Ok(Some(commands)) => {
                    commands.into_iter().for_each(|c| queue.push(c));
                    added += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping reloaded entry");
                    self.report_failed(&args, &e.to_string());
                }
            }
        }
        drop(queue);

        self.update_watched(path, extra_args, parsed.included_files);
        tracing::info!(
            path = %path.display(),
            removed = plan.remove.len(),
            added = added,
            "Command file reloaded"
        );
        self.wake.notify_one();
        Ok(())
    }

    fn update_watched(&self, path: &Path, extra_args: &[String], included_files: Vec<PathBuf>) {
        if let Some(watched) = lock(&self.watched).get_mut(path) {
            watched.extra_args = extra_args.to_vec();
            watched.included_files = included_files;
        }
    }

    /// Enable or disable command file watching for files added from now on.
    pub fn set_command_file_reload(&self, enabled: bool) {
        self.reload_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Command files registered for reload.
    pub fn watched_command_files(&self) -> Vec<WatchedCommandFile> {
        lock(&self.watched).values().cloned().collect()
    }

    /// Run `args` directly on an already leased device, bypassing the queue.
    pub async fn exec_command(
        &self,
        listener: Arc<dyn InvocationListener>,
        lease: DeviceLease,
        args: Vec<String>,
    ) -> Result<InvocationOutcome> {
        if self.is_shutdown() {
            lease.free(FreeDeviceState::Available);
            return Err(SchedulerError::Shutdown);
        }
        let config = match self.factory.create_configuration_from_args(&args) {
            Ok(config) => config,
            Err(e) => {
                lease.free(FreeDeviceState::Available);
                return Err(e.into());
            }
        };

        let tracker = CommandTracker::new(self.ids.next_id(), args, None);
        let command = QueuedCommand::new(tracker, config.device_requirements, RunMode::OneShot);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        lock(&self.running).insert(command.id(), command.tracker.clone());
        Ok(self.run_invocation(command, lease, Some(listener)).await)
    }

    /// Drop every queued command. Running invocations are unaffected.
    pub fn remove_all_commands(&self) -> usize {
        let removed = lock(&self.queue).clear();
        tracing::info!(removed = removed, "Removed all queued commands");
        self.wake.notify_one();
        removed
    }

    /// Stop allocating and end the loop. Running invocations finish on
    /// their own; use [`CommandScheduler::join`] to wait for them.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::info!("Command scheduler shutdown requested");
        }
        self.wake.notify_one();
    }

    /// Stop once the queue is empty and nothing is running, and wait for
    /// the loop to exit.
    pub async fn shutdown_on_empty(&self) {
        self.shutdown_on_empty.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let mut stopped = self.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wait for the loop and every invocation it spawned.
    pub async fn join(&self) {
        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = ?e, "Allocation loop panicked");
        }

        loop {
            let handles = std::mem::take(&mut *lock(&self.tasks));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = ?e, "Invocation task panicked");
                }
            }
        }
    }

    /// Queued and running commands, ordered by id.
    pub fn command_trackers(&self) -> Vec<CommandTracker> {
        let mut trackers = lock(&self.queue).trackers();
        trackers.extend(lock(&self.running).values().cloned());
        trackers.sort_by_key(CommandTracker::id);
        trackers
    }

    /// Number of queued and running commands.
    pub fn all_commands_size(&self) -> usize {
        lock(&self.queue).len() + lock(&self.running).len()
    }

    pub fn queued_count(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Table of queued and running commands.
    pub fn display_commands(&self) -> String {
        let running: Vec<u64> = lock(&self.running).keys().copied().collect();
        let mut out = format!("{:<6} {:<6} {:<10} {:<8} {}\n", "Id", "Runs", "Exec time", "State", "Command");
        for tracker in self.command_trackers() {
            let state = if running.contains(&tracker.id()) { "running" } else { "queued" };
            out.push_str(&format!(
                "{:<6} {:<6} {:<10} {:<8} {}\n",
                tracker.id(),
                tracker.executions(),
                format!("{}ms", tracker.total_exec_time().as_millis()),
                state,
                tracker.command_line()
            ));
        }
        out
    }

    async fn run_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
        tracing::info!(devices = self.pool.len(), "Command scheduler started");

        loop {
            // read before draining so a finished task's events are already queued
            let idle = self.in_flight.load(Ordering::SeqCst) == 0;
            while let Ok(event) = events.try_recv() {
                self.handle_event(event);
            }

            if self.is_shutdown() {
                break;
            }
            if self.shutdown_on_empty.load(Ordering::SeqCst) && idle && lock(&self.queue).is_empty() {
                tracing::info!("Queue drained and no invocations running");
                break;
            }

            let now = Instant::now();
            let poll = self.config.poll_interval;
            let wait = self
                .schedule_ready(now)
                .map_or(poll, |at| at.saturating_duration_since(now).min(poll));

            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                _ = self.wake.notified() => {}
                _ = self.pool.wait_for_free(wait) => {}
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.stopped.send_replace(true);
        tracing::info!(in_flight = self.in_flight_count(), "Command scheduler stopped");
    }

    /// One allocation pass over the queue, oldest first.
    ///
    /// Returns the earliest instant a delayed loop command becomes ready.
    fn schedule_ready(self: &Arc<Self>, now: Instant) -> Option<Instant> {
        let mut queue = lock(&self.queue);
        for id in queue.ids() {
            if self.at_capacity() {
                break;
            }
            let Some(command) = queue.get(id) else { continue };
            if !command.is_ready(now) {
                continue;
            }
            let Some(lease) = self.pool.allocate(&command.selection) else {
                continue;
            };
            if let Some(command) = queue.remove(id) {
                self.spawn_invocation(command, lease);
            }
        }
        queue.next_ready_at(now)
    }

    fn at_capacity(&self) -> bool {
        self.config
            .max_concurrent_invocations
            .is_some_and(|max| self.in_flight.load(Ordering::SeqCst) >= max)
    }

    fn spawn_invocation(self: &Arc<Self>, command: QueuedCommand, lease: DeviceLease) {
        tracing::info!(
            command_id = command.id(),
            serial = %lease.serial(),
            "Allocated device"
        );
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        lock(&self.running).insert(command.id(), command.tracker.clone());

        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.run_invocation(command, lease, None).await;
        });

        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Body of one invocation task.
    async fn run_invocation(
        &self,
        mut command: QueuedCommand,
        lease: DeviceLease,
        extra: Option<Arc<dyn InvocationListener>>,
    ) -> InvocationOutcome {
        let started = Instant::now();
        let command_id = command.id();
        let serial = lease.serial().to_string();
        let rescheduler = Rescheduler::new(
            self.event_tx.clone(),
            command.selection.clone(),
            command.tracker.command_file().map(Path::to_path_buf),
        );
        let mut listeners = self.listeners.clone();
        listeners.extend(extra);

        let outcome = self
            .executor
            .execute(&command.tracker, lease, &rescheduler, &listeners)
            .await;

        command.tracker.record_execution(started.elapsed());
        lock(&self.running).remove(&command_id);

        if command.mode == RunMode::Loop
            && !outcome.is_fatal()
            && !self.is_shutdown()
            && command.tracker.has_remaining_executions()
        {
            let pacing = LoopPacing::new(command.min_loop_time, started);
            command.ready_at = Some(pacing.ready_at());
            tracing::debug!(
                command_id = command_id,
                executions = command.tracker.executions(),
                delay_ms = pacing.remaining().as_millis() as u64,
                "Requeueing loop command"
            );
            let _ = self.event_tx.send(SchedulerEvent::Requeue { command });
        }

        // handled here so a fatal error still counts once the loop has exited
        if let InvocationOutcome::FatalError(message) = &outcome {
            self.handle_fatal(command_id, message);
        }
        let _ = self.event_tx.send(SchedulerEvent::Finished {
            command_id,
            serial,
            outcome: outcome.clone(),
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.wake.notify_one();
        outcome
    }

    fn handle_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::Finished {
                command_id,
                serial,
                outcome,
            } => {
                tracing::debug!(command_id = command_id, serial = %serial, outcome = %outcome, "Invocation finished");
            }
            SchedulerEvent::Reschedule {
                args,
                selection,
                command_file,
            } => match self.prepare_command(
                args.clone(),
                Origin::Reschedule {
                    command_file,
                    selection,
                },
            ) {
                Ok(Some(commands)) => {
                    let mut queue = lock(&self.queue);
                    for command in commands {
                        tracing::info!(
                            command_id = command.id(),
                            args = %command.tracker.command_line(),
                            "Rescheduled command queued"
                        );
                        queue.push(command);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(args = ?args, error = %e, "Cannot reschedule command");
                    self.report_failed(&args, &e.to_string());
                }
            },
            SchedulerEvent::Requeue { command } => {
                if !self.is_shutdown() {
                    lock(&self.queue).push(command);
                }
            }
        }
    }

    fn handle_fatal(&self, command_id: u64, message: &str) {
        tracing::error!(command_id = command_id, error = %message, "Fatal host error, shutting down");
        self.failure_handler.on_terrible_failure(message);
        self.shutdown();
    }

    fn report_failed(&self, args: &[String], error: &str) {
        for listener in &self.listeners {
            listener.command_failed(args, error);
        }
    }
}

fn with_extra(args: &[String], extra: &[String]) -> Vec<String> {
    args.iter().chain(extra.iter()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ArgsConfigurationFactory, Configuration};
    use crate::device::{AllocationState, Device};
    use crate::error::InvocationError;
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
        ) -> std::result::Result<(), InvocationError> {
            Ok(())
        }
    }

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    fn scheduler(devices: &[&str]) -> CommandScheduler {
        let pool = Arc::new(DevicePool::with_devices(devices.iter().map(|s| Device::new(*s))));
        CommandScheduler::new(pool, Arc::new(ArgsConfigurationFactory::new()), Arc::new(NoopInvocation))
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = CommandSchedulerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(!config.command_file_reload);
        assert_eq!(config.max_concurrent_invocations, None);
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = CommandSchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_command_file_reload(true)
            .with_default_min_loop_time(Duration::from_secs(1))
            .with_max_concurrent_invocations(2);
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert!(config.command_file_reload);
        assert_eq!(config.default_min_loop_time, Duration::from_secs(1));
        assert_eq!(config.max_concurrent_invocations, Some(2));
    }

    #[test]
    fn test_add_command_queues() {
        let scheduler = scheduler(&["SER1"]);
        assert!(scheduler.add_command(args("instrument")).unwrap());
        assert!(scheduler.add_command(args("instrument --loop")).unwrap());
        assert_eq!(scheduler.queued_count(), 2);
        assert_eq!(scheduler.all_commands_size(), 2);

        let ids: Vec<u64> = scheduler.command_trackers().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_help_and_dry_run_not_queued() {
        let scheduler = scheduler(&["SER1"]);
        assert!(!scheduler.add_command(args("instrument --help")).unwrap());
        assert!(!scheduler.add_command(args("instrument --dry-run")).unwrap());
        assert_eq!(scheduler.queued_count(), 0);
    }

    #[test]
    fn test_bad_args_rejected() {
        let scheduler = scheduler(&["SER1"]);
        let err = scheduler.add_command(args("instrument --bogus")).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert_eq!(scheduler.queued_count(), 0);
    }

    #[test]
    fn test_add_after_shutdown_rejected() {
        let scheduler = scheduler(&["SER1"]);
        scheduler.shutdown();
        assert!(scheduler.is_shutdown());
        assert!(!scheduler.add_command(args("instrument")).unwrap());
    }

    #[test]
    fn test_default_min_loop_time_applied() {
        let scheduler = scheduler(&["SER1"])
            .with_config(CommandSchedulerConfig::default().with_default_min_loop_time(Duration::from_secs(3)));
        scheduler.add_command(args("a --loop")).unwrap();
        scheduler.add_command(args("b --loop --min-loop-time 50")).unwrap();

        let queue = lock(&scheduler.queue);
        let times: Vec<Duration> = queue.iter().map(|c| c.min_loop_time).collect();
        assert_eq!(times, vec![Duration::from_secs(3), Duration::from_millis(50)]);
    }

    #[test]
    fn test_shard_count_splits_on_submission() {
        let catalog = StaticTestCatalog::default()
            .with_class("a.B", &["t1", "t2"])
            .with_class("a.C", &["t1"]);
        let scheduler = scheduler(&["SER1"]).with_test_catalog(Arc::new(catalog));

        assert!(scheduler.add_command(args("host --class a.B --class a.C --shard-count 2")).unwrap());
        assert_eq!(scheduler.queued_count(), 2);
        // unshardable commands are queued whole
        assert!(scheduler.add_command(args("host --class a.B --shard-count 2")).unwrap());
        assert_eq!(scheduler.queued_count(), 3);
    }

    #[test]
    fn test_remove_all_commands() {
        let scheduler = scheduler(&["SER1"]);
        scheduler.add_command(args("a")).unwrap();
        scheduler.add_command(args("b")).unwrap();
        assert_eq!(scheduler.remove_all_commands(), 2);
        assert_eq!(scheduler.queued_count(), 0);
    }

    #[test]
    fn test_display_commands() {
        let scheduler = scheduler(&["SER1"]);
        scheduler.add_command(args("instrument --loop")).unwrap();
        let table = scheduler.display_commands();
        assert!(table.starts_with("Id"));
        assert!(table.contains("instrument --loop"));
        assert!(table.contains("queued"));
    }

    #[test]
    fn test_add_command_file_with_extra_args() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a\nb --bogus\nc --loop\n").unwrap();

        let scheduler = scheduler(&["SER1"]);
        let added = scheduler.add_command_file(&path, &args("--serial SER1")).unwrap();
        assert_eq!(added, 2);

        let lines: Vec<String> = scheduler.command_trackers().iter().map(|t| t.command_line()).collect();
        assert_eq!(lines, vec!["a --serial SER1", "c --loop --serial SER1"]);
        assert!(scheduler.watched_command_files().is_empty());
    }

    #[test]
    fn test_watched_file_added_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a --loop\n").unwrap();

        let scheduler = scheduler(&["SER1"]).with_config(CommandSchedulerConfig::default().with_command_file_reload(true));
        assert_eq!(scheduler.add_command_file(&path, &[]).unwrap(), 1);
        assert_eq!(scheduler.add_command_file(&path, &[]).unwrap(), 0);
        assert_eq!(scheduler.queued_count(), 1);
        assert_eq!(scheduler.watched_command_files().len(), 1);
    }

    #[test]
    fn test_notify_file_changed_diffs_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a --loop\nb --loop\n").unwrap();

        let scheduler = scheduler(&["SER1"]).with_config(CommandSchedulerConfig::default().with_command_file_reload(true));
        scheduler.add_command_file(&path, &[]).unwrap();
        scheduler.add_command(args("manual")).unwrap();

        std::fs::write(&path, "b --loop\nc --loop\n").unwrap();
        scheduler.notify_file_changed(&path, &[]).unwrap();

        let trackers = scheduler.command_trackers();
        let summary: Vec<(u64, String)> = trackers.iter().map(|t| (t.id(), t.command_line())).collect();
        assert_eq!(
            summary,
            vec![
                (2, "b --loop".to_string()),
                (3, "manual".to_string()),
                (4, "c --loop".to_string()),
            ]
        );
    }

    #[test]
    fn test_reload_keeps_rescheduled_command() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "a --loop\n").unwrap();

        let scheduler = scheduler(&["SER1"]).with_config(CommandSchedulerConfig::default().with_command_file_reload(true));
        scheduler.add_command_file(&path, &[]).unwrap();
        scheduler.handle_event(SchedulerEvent::Reschedule {
            args: args("a --class x.Remaining"),
            selection: DeviceSelectionSpec::default(),
            command_file: Some(path.clone()),
        });
        assert_eq!(scheduler.queued_count(), 2);

        std::fs::write(&path, "a --loop\nb\n").unwrap();
        scheduler.notify_file_changed(&path, &[]).unwrap();

        let summary: Vec<(u64, String)> = scheduler
            .command_trackers()
            .iter()
            .map(|t| (t.id(), t.command_line()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, "a --loop".to_string()),
                (2, "a --class x.Remaining".to_string()),
                (3, "b".to_string()),
            ]
        );
        let rescheduled = &scheduler.command_trackers()[1];
        assert_eq!(rescheduled.command_file(), Some(path.as_path()));
        assert!(rescheduled.file_line().is_none());
    }

    #[test]
    fn test_reload_keeps_shards_of_unchanged_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cmds.txt");
        std::fs::write(&path, "host --class a.B --class a.C --shard-count 2\n").unwrap();

        let catalog = StaticTestCatalog::default()
            .with_class("a.B", &["t1", "t2"])
            .with_class("a.C", &["t1"]);
        let scheduler = scheduler(&["SER1"])
            .with_config(CommandSchedulerConfig::default().with_command_file_reload(true))
            .with_test_catalog(Arc::new(catalog));
        assert_eq!(scheduler.add_command_file(&path, &[]).unwrap(), 1);

        let ids = |s: &CommandScheduler| s.command_trackers().iter().map(|t| t.id()).collect::<Vec<u64>>();
        let shard_ids = ids(&scheduler);
        assert_eq!(shard_ids.len(), 2);

        scheduler.notify_file_changed(&path, &[]).unwrap();
        assert_eq!(ids(&scheduler), shard_ids);

        std::fs::write(&path, "host --class a.B\n").unwrap();
        scheduler.notify_file_changed(&path, &[]).unwrap();
        let lines: Vec<String> = scheduler.command_trackers().iter().map(|t| t.command_line()).collect();
        assert_eq!(lines, vec!["host --class a.B"]);
        assert!(!ids(&scheduler).iter().any(|id| shard_ids.contains(id)));
    }

    #[tokio::test]
    async fn test_shutdown_on_empty_without_start() {
        let scheduler = scheduler(&["SER1"]);
        scheduler.shutdown_on_empty().await;
        scheduler.join().await;
    }

    #[tokio::test]
    async fn test_exec_command_bypasses_queue() {
        struct Quiet;
        impl InvocationListener for Quiet {}

        let scheduler = scheduler(&["SER1"]);
        let lease = scheduler.pool().allocate(&DeviceSelectionSpec::default()).unwrap();
        let outcome = scheduler
            .exec_command(Arc::new(Quiet), lease, args("instrument"))
            .await
            .unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed);
        assert_eq!(scheduler.pool().state_of("SER1"), Some(AllocationState::Free));
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_exec_command_bad_args_frees_device() {
        struct Quiet;
        impl InvocationListener for Quiet {}

        let scheduler = scheduler(&["SER1"]);
        let lease = scheduler.pool().allocate(&DeviceSelectionSpec::default()).unwrap();
        let result = scheduler.exec_command(Arc::new(Quiet), lease, args("--bogus")).await;
        assert!(result.is_err());
        assert_eq!(scheduler.pool().available_count(), 1);
    }
}
