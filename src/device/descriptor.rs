//! Device records.
//!
//! A [`Device`] is owned by exactly one party at a time: the pool while it is
//! free, or the [`DeviceLease`](crate::device::DeviceLease) of the invocation
//! currently running on it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Board name property, used as the product type when set.
pub const PROP_PRODUCT_BOARD: &str = "ro.product.board";

/// Device name property, the product-device type and product type fallback.
pub const PROP_PRODUCT_DEVICE: &str = "ro.product.device";

/// What sort of target a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Physical or emulated hardware reached over the device transport
    Real,
    /// Placeholder for a target that is not currently reachable
    Stub,
    /// Placeholder for a device reached over TCP
    Tcp,
    /// Host-only stand-in used by commands that need no device
    Null,
}

impl DeviceKind {
    /// Placeholders simulate infrastructure and are never withheld from the pool.
    pub fn is_placeholder(self) -> bool {
        match self {
            DeviceKind::Real => false,
            DeviceKind::Stub | DeviceKind::Tcp | DeviceKind::Null => true,
        }
    }

    pub fn is_null(self) -> bool {
        self == DeviceKind::Null
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Real => write!(f, "real"),
            DeviceKind::Stub => write!(f, "stub"),
            DeviceKind::Tcp => write!(f, "tcp"),
            DeviceKind::Null => write!(f, "null"),
        }
    }
}

/// Connection state as last observed by whoever holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Online,
    NotAvailable,
}

/// How aggressively the device transport should try to recover a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Recover until the device is fully available
    Available,
    /// Recover only until the device is online
    OnlineOnly,
    /// Do not attempt recovery
    None,
}

/// An execution target and its mutable runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    serial: String,
    kind: DeviceKind,
    emulator: bool,
    properties: BTreeMap<String, String>,
    state: DeviceState,
    recovery_mode: RecoveryMode,
}

impl Device {
    /// Create an online, real, non-emulator device.
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: DeviceKind::Real,
            emulator: false,
            properties: BTreeMap::new(),
            state: DeviceState::Online,
            recovery_mode: RecoveryMode::Available,
        }
    }

    /// Create a host-only null device.
    pub fn null(serial: impl Into<String>) -> Self {
        Self::new(serial).with_kind(DeviceKind::Null)
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_emulator(mut self, emulator: bool) -> Self {
        self.emulator = emulator;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_recovery_mode(mut self, mode: RecoveryMode) -> Self {
        self.recovery_mode = mode;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn is_emulator(&self) -> bool {
        self.emulator
    }

    pub fn is_null_device(&self) -> bool {
        self.kind.is_null()
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind.is_placeholder()
    }

    /// Look up a device property. Empty values count as set.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Board name, falling back to the device name when the board is unset or empty.
    pub fn product_type(&self) -> Option<&str> {
        match self.property(PROP_PRODUCT_BOARD) {
            Some(board) if !board.is_empty() => Some(board),
            _ => self.product_device_type(),
        }
    }

    pub fn product_device_type(&self) -> Option<&str> {
        self.property(PROP_PRODUCT_DEVICE)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn set_state(&mut self, state: DeviceState) {
        self.state = state;
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        self.recovery_mode
    }

    pub fn set_recovery_mode(&mut self, mode: RecoveryMode) {
        self.recovery_mode = mode;
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.serial, self.kind)
    }
}
