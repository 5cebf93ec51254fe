//! Device pool with exclusive, lease-based allocation.
//!
//! The pool is the only place device allocation state changes. Allocation
//! moves the [`Device`] out of its slot into a [`DeviceLease`]; freeing moves
//! it back. Since the device value itself travels with the lease, two
//! invocations can never hold the same device.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use crate::device::{Device, DeviceSelectionSpec, DeviceState, RecoveryMode, matches};
use crate::id::null_device_serial;

/// Allocation state of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AllocationState {
    Free,
    Allocated,
    Unavailable,
}

impl fmt::Display for AllocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationState::Free => write!(f, "free"),
            AllocationState::Allocated => write!(f, "allocated"),
            AllocationState::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// What the holder of a device reports when handing it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FreeDeviceState {
    /// Healthy, return it to the pool
    Available,
    /// Lost; keep it out of rotation
    Unavailable,
    /// Holder could not tell; decide from the device's connection state
    UnknownState,
}

#[derive(Debug)]
struct Slot {
    serial: String,
    state: AllocationState,
    /// `None` while a lease holds the device.
    device: Option<Device>,
}

/// Concurrent registry of devices.
#[derive(Debug, Default)]
pub struct DevicePool {
    slots: Mutex<Vec<Slot>>,
    freed: Notify,
}

impl DevicePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from an inventory, in registration order.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let pool = Self::new();
        for device in devices {
            pool.register_device(device);
        }
        pool
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a device as free.
    ///
    /// Re-registering a serial that is unavailable brings it back; a serial
    /// that is free or allocated is left alone and `false` is returned.
    pub fn register_device(&self, device: Device) -> bool {
        let mut slots = self.lock();
        let serial = device.serial().to_string();

        if let Some(slot) = slots.iter_mut().find(|s| s.serial == serial) {
            if slot.state != AllocationState::Unavailable {
                tracing::debug!(serial = %serial, state = %slot.state, "Device already registered");
                return false;
            }
            slot.state = AllocationState::Free;
            slot.device = Some(device);
            tracing::info!(serial = %serial, "Device returned to pool");
        } else {
            tracing::info!(serial = %serial, kind = %device.kind(), "Device registered");
            slots.push(Slot {
                serial,
                state: AllocationState::Free,
                device: Some(device),
            });
        }
        drop(slots);

        self.freed.notify_waiters();
        true
    }

    /// Resize the set of generated null devices to exactly `count`.
    ///
    /// Extra null devices are dropped only while free; allocated ones are
    /// kept until they are returned.
    pub fn set_null_device_count(&self, count: usize) {
        for index in 0..count {
            let serial = null_device_serial(index);
            let known = self.lock().iter().any(|s| s.serial == serial);
            if !known {
                self.register_device(Device::null(serial));
            }
        }

        let mut slots = self.lock();
        slots.retain(|slot| {
            let surplus = slot
                .device
                .as_ref()
                .is_some_and(|d| d.is_null_device() && !is_generated_below(&slot.serial, count));
            !(surplus && slot.state == AllocationState::Free)
        });
    }

    /// Try to claim the first free device that satisfies `spec`.
    ///
    /// Devices are tried in registration order so the choice is
    /// deterministic.
    pub fn allocate(self: &Arc<Self>, spec: &DeviceSelectionSpec) -> Option<DeviceLease> {
        let mut slots = self.lock();
        let slot = slots.iter_mut().find(|slot| {
            slot.state == AllocationState::Free && slot.device.as_ref().is_some_and(|d| matches(d, spec))
        })?;

        let device = slot.device.take()?;
        slot.state = AllocationState::Allocated;
        tracing::debug!(serial = %slot.serial, "Device allocated");

        Some(DeviceLease {
            device: Some(device),
            pool: Arc::clone(self),
        })
    }

    /// Claim a matching device, waiting up to `timeout` for one to be freed.
    pub async fn allocate_wait(
        self: &Arc<Self>,
        spec: &DeviceSelectionSpec,
        timeout: Duration,
    ) -> Option<DeviceLease> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.allocate(spec) {
                return Some(lease);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.allocate(spec),
            }
        }
    }

    /// Wait until some device is returned to the pool, or `timeout` elapses.
    pub async fn wait_for_free(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.freed.notified()).await;
    }

    /// Put a leased device back and decide its new state.
    fn release(&self, mut device: Device, reported: FreeDeviceState) -> AllocationState {
        let next = if device.is_placeholder() {
            AllocationState::Free
        } else {
            match reported {
                FreeDeviceState::Available => AllocationState::Free,
                FreeDeviceState::Unavailable => AllocationState::Unavailable,
                FreeDeviceState::UnknownState => match device.state() {
                    DeviceState::Online => AllocationState::Free,
                    DeviceState::NotAvailable => AllocationState::Unavailable,
                },
            }
        };

        if next == AllocationState::Free {
            device.set_recovery_mode(RecoveryMode::Available);
        }

        let serial = device.serial().to_string();
        let mut slots = self.lock();
        match slots.iter_mut().find(|s| s.serial == serial) {
            Some(slot) => {
                slot.state = next;
                slot.device = Some(device);
            }
            None => {
                // slot was removed while leased; keep the device anyway
                slots.push(Slot {
                    serial: serial.clone(),
                    state: next,
                    device: Some(device),
                });
            }
        }
        drop(slots);

        tracing::info!(serial = %serial, reported = ?reported, state = %next, "Device freed");
        if next == AllocationState::Free {
            self.freed.notify_waiters();
        }
        next
    }

    /// Number of devices currently free.
    pub fn available_count(&self) -> usize {
        self.count(AllocationState::Free)
    }

    pub fn allocated_count(&self) -> usize {
        self.count(AllocationState::Allocated)
    }

    pub fn unavailable_count(&self) -> usize {
        self.count(AllocationState::Unavailable)
    }

    fn count(&self, state: AllocationState) -> usize {
        self.lock().iter().filter(|s| s.state == state).count()
    }

    /// Total registered devices, in any state.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// State of a single device, if registered.
    pub fn state_of(&self, serial: &str) -> Option<AllocationState> {
        self.lock().iter().find(|s| s.serial == serial).map(|s| s.state)
    }

    /// A copy of a free or unavailable device; `None` while leased.
    pub fn device(&self, serial: &str) -> Option<Device> {
        self.lock()
            .iter()
            .find(|s| s.serial == serial)
            .and_then(|s| s.device.clone())
    }

    /// Serial and state of every device, in registration order.
    pub fn snapshot(&self) -> Vec<(String, AllocationState)> {
        self.lock().iter().map(|s| (s.serial.clone(), s.state)).collect()
    }
}

fn is_generated_below(serial: &str, count: usize) -> bool {
    serial
        .strip_prefix("null-device-")
        .and_then(|n| n.parse::<usize>().ok())
        .is_some_and(|n| n < count)
}

/// Exclusive hold on one device.
///
/// Dropping a lease without calling [`DeviceLease::free`] returns the device
/// with [`FreeDeviceState::UnknownState`], so every exit path gives it back.
#[derive(Debug)]
pub struct DeviceLease {
    device: Option<Device>,
    pool: Arc<DevicePool>,
}

impl DeviceLease {
    pub fn device(&self) -> &Device {
        self.device.as_ref().expect("device is held until the lease is freed")
    }

    pub fn device_mut(&mut self) -> &mut Device {
        self.device.as_mut().expect("device is held until the lease is freed")
    }

    pub fn serial(&self) -> &str {
        self.device().serial()
    }

    /// Return the device to the pool.
    pub fn free(mut self, state: FreeDeviceState) -> AllocationState {
        match self.device.take() {
            Some(device) => self.pool.release(device, state),
            None => AllocationState::Free,
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            tracing::warn!(serial = %device.serial(), "Device lease dropped without free");
            self.pool.release(device, FreeDeviceState::UnknownState);
        }
    }
}
