//! Device selection constraints and the matcher that applies them.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Constraints a command places on the device it runs on.
///
/// An empty set means "no constraint" for that dimension. The emulator and
/// null-device flags are exact: a plain command never lands on an emulator
/// or a null device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSelectionSpec {
    pub serials: BTreeSet<String>,
    pub exclude_serials: BTreeSet<String>,
    pub product_types: BTreeSet<String>,
    pub product_device_types: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
    pub emulator_requested: bool,
    pub null_device_requested: bool,
}

impl DeviceSelectionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serials.insert(serial.into());
        self
    }

    pub fn with_exclude_serial(mut self, serial: impl Into<String>) -> Self {
        self.exclude_serials.insert(serial.into());
        self
    }

    pub fn with_product_type(mut self, product_type: impl Into<String>) -> Self {
        self.product_types.insert(product_type.into());
        self
    }

    pub fn with_product_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.product_device_types.insert(device_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_emulator(mut self, requested: bool) -> Self {
        self.emulator_requested = requested;
        self
    }

    pub fn with_null_device(mut self, requested: bool) -> Self {
        self.null_device_requested = requested;
        self
    }

    /// Check whether `device` satisfies every constraint.
    pub fn matches(&self, device: &Device) -> bool {
        matches(device, self)
    }
}

/// Returns true if `device` satisfies every constraint in `spec`.
///
/// Total and side-effect free; a missing property fails only the predicate
/// that needed it.
pub fn matches(device: &Device, spec: &DeviceSelectionSpec) -> bool {
    let serial = device.serial();

    if !spec.serials.is_empty() && !spec.serials.contains(serial) {
        return false;
    }
    if spec.exclude_serials.contains(serial) {
        return false;
    }
    if !spec.product_types.is_empty() && !in_set(&spec.product_types, device.product_type()) {
        return false;
    }
    if !spec.product_device_types.is_empty()
        && !in_set(&spec.product_device_types, device.product_device_type())
    {
        return false;
    }
    for (key, value) in &spec.properties {
        if device.property(key) != Some(value.as_str()) {
            return false;
        }
    }
    // only match an emulator if explicitly requested, and vice versa
    if spec.emulator_requested != device.is_emulator() {
        return false;
    }
    if spec.null_device_requested != device.is_null_device() {
        return false;
    }

    true
}

fn in_set(set: &BTreeSet<String>, value: Option<&str>) -> bool {
    value.is_some_and(|v| set.contains(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, PROP_PRODUCT_BOARD, PROP_PRODUCT_DEVICE};

    fn phone() -> Device {
        Device::new("SER1")
            .with_property(PROP_PRODUCT_BOARD, "sprout")
            .with_property(PROP_PRODUCT_DEVICE, "crespo")
            .with_property("ro.build.type", "userdebug")
    }

    /// A spec that `phone()` satisfies on every dimension.
    fn full_spec() -> DeviceSelectionSpec {
        DeviceSelectionSpec::new()
            .with_serial("SER1")
            .with_exclude_serial("SER9")
            .with_product_type("sprout")
            .with_product_device_type("crespo")
            .with_property("ro.build.type", "userdebug")
    }

    #[test]
    fn test_empty_spec_matches_plain_device() {
        assert!(matches(&phone(), &DeviceSelectionSpec::new()));
    }

    #[test]
    fn test_full_spec_matches() {
        assert!(full_spec().matches(&phone()));
    }

    #[test]
    fn test_serial_mismatch() {
        let mut spec = full_spec();
        spec.serials = ["SER2".to_string()].into();
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_excluded_serial() {
        let spec = full_spec().with_exclude_serial("SER1");
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_product_type_mismatch() {
        let mut spec = full_spec();
        spec.product_types = ["mako".to_string()].into();
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_product_type_uses_device_fallback() {
        let device = Device::new("SER1").with_property(PROP_PRODUCT_DEVICE, "crespo");
        let spec = DeviceSelectionSpec::new().with_product_type("crespo");
        assert!(matches(&device, &spec));
    }

    #[test]
    fn test_product_type_missing_property() {
        let spec = DeviceSelectionSpec::new().with_product_type("sprout");
        assert!(!matches(&Device::new("SER1"), &spec));
    }

    #[test]
    fn test_product_device_type_mismatch() {
        let mut spec = full_spec();
        spec.product_device_types = ["mako".to_string()].into();
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_property_value_mismatch() {
        let spec = full_spec().with_property("ro.build.type", "user");
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_property_missing() {
        let spec = full_spec().with_property("ro.secure", "1");
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_emulator_must_be_requested() {
        let emulator = Device::new("emulator-5554").with_emulator(true);
        assert!(!matches(&emulator, &DeviceSelectionSpec::new()));
        assert!(matches(&emulator, &DeviceSelectionSpec::new().with_emulator(true)));
    }

    #[test]
    fn test_emulator_request_excludes_real_device() {
        let spec = full_spec().with_emulator(true);
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_null_device_must_be_requested() {
        let null = Device::null("null-device-0");
        assert!(!matches(&null, &DeviceSelectionSpec::new()));
        assert!(matches(&null, &DeviceSelectionSpec::new().with_null_device(true)));
    }

    #[test]
    fn test_null_request_excludes_real_device() {
        let spec = full_spec().with_null_device(true);
        assert!(!matches(&phone(), &spec));
    }

    #[test]
    fn test_stub_placeholder_matches_like_real() {
        let stub = Device::new("SER1").with_kind(DeviceKind::Stub);
        assert!(matches(&stub, &DeviceSelectionSpec::new().with_serial("SER1")));
    }
}
