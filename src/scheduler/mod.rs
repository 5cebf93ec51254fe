//! Scheduler module: the command queue and the allocation loop.
//!
//! This module provides:
//! - **Queue**: commands waiting for a device, offered oldest first.
//! - **Events**: messages invocation tasks send back to the loop.
//! - **Reload**: diffing a changed command file against the queue.
//! - **Pacing**: minimum interval between loop-mode iterations.
//! - **CommandScheduler**: the allocation loop and its control surface.
//!
//! # Architecture
//!
//! The scheduler uses a polling model:
//! 1. The loop scans the queue and asks the DevicePool for a matching device
//! 2. Each match is spawned as an async task running the InvocationExecutor
//! 3. Tasks report completions, reschedules and requeues over a channel
//! 4. The loop applies those events and scans again
//!
//! # Example
//!
//! ```ignore
//! use cmdsched::command::ArgsConfigurationFactory;
//! use cmdsched::device::{Device, DevicePool};
//! use cmdsched::invocation::ProcessInvocation;
//! use cmdsched::scheduler::CommandScheduler;
//!
//! let pool = Arc::new(DevicePool::with_devices([Device::new("SER1")]));
//! let scheduler = Arc::new(CommandScheduler::new(
//!     pool,
//!     Arc::new(ArgsConfigurationFactory::new()),
//!     Arc::new(ProcessInvocation::default()),
//! ));
//! scheduler.start();
//! scheduler.add_command(vec!["instrument".into()])?;
//! scheduler.shutdown_on_empty().await;
//! scheduler.join().await;
//! ```

mod command_scheduler;
mod event;
mod pacing;
mod queue;
mod reload;

pub use command_scheduler::{CommandScheduler, CommandSchedulerConfig, WatchedCommandFile};
pub use event::SchedulerEvent;
pub use pacing::LoopPacing;
pub use queue::{CommandQueue, QueuedCommand};
pub use reload::{ReloadPlan, diff_command_file};
