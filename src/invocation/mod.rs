//! Invocation layer: running one command on one allocated device.
//!
//! - **Traits**: the [`Invocation`] callable, the [`Rescheduler`] capability
//!   it receives, and the listener/failure-handler observers.
//! - **Executor**: [`InvocationExecutor`] builds a fresh configuration per
//!   attempt, maps the invocation's result to an [`InvocationOutcome`] and
//!   frees the device exactly once.
//! - **Process**: [`ProcessInvocation`] runs a host process per command.

mod executor;
mod process;
mod traits;

pub use executor::{InvocationExecutor, InvocationOutcome};
pub use process::{DEFAULT_DEVICE_LOST_EXIT_CODE, DEVICE_SERIAL_ENV, ProcessConfig, ProcessInvocation};
pub use traits::{Invocation, InvocationListener, LoggingFailureHandler, Rescheduler, TerribleFailureHandler};
