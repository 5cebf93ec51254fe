//! Runs one command on one leased device.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::command::{CommandTracker, ConfigurationFactory};
use crate::device::{DeviceLease, DeviceState, FreeDeviceState};
use crate::error::InvocationError;
use crate::invocation::traits::{Invocation, InvocationListener, Rescheduler};

/// Result of one execution, as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The invocation ran to completion; test failures included.
    Completed,
    /// The device was lost mid-run and taken out of rotation.
    DeviceLost { serial: String, message: String },
    /// The host is in an unrecoverable state.
    FatalError(String),
    /// The command could not be run, or the invocation failed unexpectedly.
    Failed(String),
}

impl InvocationOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvocationOutcome::FatalError(_))
    }
}

impl fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationOutcome::Completed => write!(f, "completed"),
            InvocationOutcome::DeviceLost { serial, .. } => write!(f, "device {} lost", serial),
            InvocationOutcome::FatalError(msg) => write!(f, "fatal: {}", msg),
            InvocationOutcome::Failed(msg) => write!(f, "failed: {}", msg),
        }
    }
}

/// Runs invocations and guarantees the device goes back exactly once.
pub struct InvocationExecutor {
    factory: Arc<dyn ConfigurationFactory>,
    invocation: Arc<dyn Invocation>,
    listeners: Vec<Arc<dyn InvocationListener>>,
}

impl InvocationExecutor {
    pub fn new(factory: Arc<dyn ConfigurationFactory>, invocation: Arc<dyn Invocation>) -> Self {
        Self {
            factory,
            invocation,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn InvocationListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Run `tracker` on the leased device.
    ///
    /// The configuration is rebuilt from the tracker's arguments for this
    /// attempt only. `extra` listeners are notified alongside the executor's
    /// own.
    pub async fn execute(
        &self,
        tracker: &CommandTracker,
        mut lease: DeviceLease,
        rescheduler: &Rescheduler,
        extra: &[Arc<dyn InvocationListener>],
    ) -> InvocationOutcome {
        let listeners = || self.listeners.iter().chain(extra.iter());

        let config = match self.factory.create_configuration_from_args(tracker.args()) {
            Ok(config) => config,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(command_id = tracker.id(), error = %message, "Cannot build configuration");
                listeners().for_each(|l| l.command_failed(tracker.args(), &message));
                let device = lease.device().clone();
                lease.free(FreeDeviceState::Available);
                listeners().for_each(|l| l.invocation_complete(&device, FreeDeviceState::Available));
                return InvocationOutcome::Failed(message);
            }
        };

        listeners().for_each(|l| l.invocation_started(tracker, lease.device()));
        tracing::info!(
            command_id = tracker.id(),
            serial = %lease.serial(),
            config = %config.name,
            "Invocation started"
        );

        let result = AssertUnwindSafe(self.invocation.invoke(lease.device_mut(), &config, rescheduler))
            .catch_unwind()
            .await;

        let (free_state, outcome) = match result {
            Ok(Ok(())) => {
                let state = match lease.device().state() {
                    DeviceState::NotAvailable => FreeDeviceState::Unavailable,
                    DeviceState::Online => FreeDeviceState::Available,
                };
                (state, InvocationOutcome::Completed)
            }
            Ok(Err(InvocationError::DeviceNotAvailable { serial, message })) => {
                (FreeDeviceState::Unavailable, InvocationOutcome::DeviceLost { serial, message })
            }
            Ok(Err(InvocationError::FatalHost(message))) => {
                (FreeDeviceState::UnknownState, InvocationOutcome::FatalError(message))
            }
            Ok(Err(InvocationError::Other(message))) => (FreeDeviceState::UnknownState, InvocationOutcome::Failed(message)),
            Err(payload) => {
                let message = format!("invocation panicked: {}", panic_message(payload.as_ref()));
                (FreeDeviceState::UnknownState, InvocationOutcome::Failed(message))
            }
        };

        let device = lease.device().clone();
        let state = lease.free(free_state);

        match &outcome {
            InvocationOutcome::Completed => {
                tracing::info!(command_id = tracker.id(), serial = %device.serial(), state = %state, "Invocation complete");
            }
            InvocationOutcome::FatalError(message) => {
                tracing::error!(command_id = tracker.id(), serial = %device.serial(), error = %message, "Fatal host error");
            }
            other => {
                tracing::warn!(command_id = tracker.id(), serial = %device.serial(), outcome = %other, "Invocation failed");
                listeners().for_each(|l| l.command_failed(tracker.args(), &other.to_string()));
            }
        }

        listeners().for_each(|l| l.invocation_complete(&device, free_state));
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
