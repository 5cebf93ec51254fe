//! Collaborator traits for running a command on a device.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::{CommandTracker, Configuration};
use crate::device::{Device, DeviceSelectionSpec, FreeDeviceState};
use crate::error::InvocationError;
use crate::scheduler::SchedulerEvent;

/// The test-execution callable run against one allocated device.
///
/// Ordinary test failures are not errors: return `Ok(())` and report them
/// through whatever result channel the invocation owns.
#[async_trait]
pub trait Invocation: Send + Sync {
    async fn invoke(
        &self,
        device: &mut Device,
        config: &Configuration,
        rescheduler: &Rescheduler,
    ) -> Result<(), InvocationError>;
}

/// Capability handed to a running invocation for queueing follow-up work.
///
/// Commands are sent to the scheduler's allocation loop, which enqueues them
/// on its own task.
#[derive(Debug, Clone)]
pub struct Rescheduler {
    tx: mpsc::UnboundedSender<SchedulerEvent>,
    selection: DeviceSelectionSpec,
    command_file: Option<PathBuf>,
}

impl Rescheduler {
    pub fn new(
        tx: mpsc::UnboundedSender<SchedulerEvent>,
        selection: DeviceSelectionSpec,
        command_file: Option<PathBuf>,
    ) -> Self {
        Self {
            tx,
            selection,
            command_file,
        }
    }

    /// Queue `args` as a new command.
    ///
    /// Without an explicit `selection` the follow-up inherits the device
    /// constraints of the command that is running. Returns `false` once the
    /// scheduler has gone away.
    pub fn schedule(&self, args: Vec<String>, selection: Option<DeviceSelectionSpec>) -> bool {
        let selection = selection.unwrap_or_else(|| self.selection.clone());
        tracing::debug!(args = ?args, "Reschedule requested");
        self.tx
            .send(SchedulerEvent::Reschedule {
                args,
                selection,
                command_file: self.command_file.clone(),
            })
            .is_ok()
    }
}

/// Observer of invocation lifecycle events.
pub trait InvocationListener: Send + Sync {
    fn invocation_started(&self, _tracker: &CommandTracker, _device: &Device) {}

    /// Called after the device has been handed back to the pool.
    fn invocation_complete(&self, _device: &Device, _free_state: FreeDeviceState) {}

    /// Called when a command could not be run or its run failed.
    fn command_failed(&self, _args: &[String], _error: &str) {}
}

/// Receives host-level failures that force the scheduler to stop.
pub trait TerribleFailureHandler: Send + Sync {
    fn on_terrible_failure(&self, message: &str);
}

/// Default handler: log and carry on shutting down.
#[derive(Debug, Clone, Default)]
pub struct LoggingFailureHandler;

impl TerribleFailureHandler for LoggingFailureHandler {
    fn on_terrible_failure(&self, message: &str) {
        tracing::error!(error = %message, "Terrible failure, scheduler shutting down");
    }
}
