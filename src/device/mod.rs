//! Device layer: records, selection constraints and the shared pool.
//!
//! - **Descriptor**: [`Device`] with its [`DeviceKind`] tag, properties and
//!   connection/recovery state.
//! - **Selection**: [`DeviceSelectionSpec`] and the pure [`matches`] predicate.
//! - **Pool**: [`DevicePool`] hands out exclusive [`DeviceLease`]s and decides
//!   what happens to a device when it comes back.

mod descriptor;
mod pool;
mod selection;

pub use descriptor::{Device, DeviceKind, DeviceState, PROP_PRODUCT_BOARD, PROP_PRODUCT_DEVICE, RecoveryMode};
pub use pool::{AllocationState, DeviceLease, DevicePool, FreeDeviceState};
pub use selection::{DeviceSelectionSpec, matches};
