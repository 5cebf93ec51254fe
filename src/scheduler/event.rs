//! Messages sent from invocation tasks back to the allocation loop.

use std::path::PathBuf;

use crate::device::DeviceSelectionSpec;
use crate::invocation::InvocationOutcome;
use crate::scheduler::queue::QueuedCommand;

/// Event reported to the scheduler's allocation loop.
///
/// Invocation tasks never touch the queue; they send one of these and the
/// loop applies it on its own task.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// An invocation finished and its device has been freed. A fatal
    /// outcome stops the scheduler.
    Finished {
        command_id: u64,
        serial: String,
        outcome: InvocationOutcome,
    },
    /// A running invocation asked for a follow-up command.
    Reschedule {
        args: Vec<String>,
        selection: DeviceSelectionSpec,
        command_file: Option<PathBuf>,
    },
    /// A loop-mode command going back in the queue; its `ready_at` holds
    /// the loop delay.
    Requeue { command: QueuedCommand },
}

impl SchedulerEvent {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Finished { .. } => "finished",
            SchedulerEvent::Reschedule { .. } => "reschedule",
            SchedulerEvent::Requeue { .. } => "requeue",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind() {
        let event = SchedulerEvent::Reschedule {
            args: vec!["retry".into()],
            selection: DeviceSelectionSpec::default(),
            command_file: None,
        };
        assert_eq!(event.kind(), "reschedule");

        let event = SchedulerEvent::Finished {
            command_id: 1,
            serial: "SER1".into(),
            outcome: InvocationOutcome::FatalError("disk full".into()),
        };
        assert_eq!(event.kind(), "finished");
    }
}
