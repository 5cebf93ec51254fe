//! cmdsched - schedules test commands onto a pool of devices
//!
//! Commands are argument vectors. The scheduler queues them, matches each to
//! a free device from the [`device::DevicePool`], runs it through an
//! [`invocation::Invocation`] and returns the device to the pool afterwards.
//! Commands can loop, be split into shards across devices, and be loaded from
//! command files that are reloaded when they change.

pub mod command;
pub mod device;
pub mod error;
pub mod id;
pub mod invocation;
pub mod scheduler;
pub mod watcher;

pub use error::{ConfigurationError, InvocationError, Result, SchedulerError};
