use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cmdsched::command::StaticTestCatalog;
use cmdsched::device::{Device, DeviceKind, DevicePool};
use cmdsched::invocation::ProcessConfig;
use cmdsched::scheduler::CommandSchedulerConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub scheduler: SchedulerConfig,
    pub devices: Vec<DeviceEntry>,
    pub null_devices: usize,
    pub invocation: ProcessConfig,
    /// Test class name to its test methods, used for sharding.
    pub test_catalog: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub command_file_reload: bool,
    pub reload_poll_interval_ms: u64,
    pub default_min_loop_time_ms: u64,
    pub max_concurrent_invocations: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            command_file_reload: false,
            reload_poll_interval_ms: 5000,
            default_min_loop_time_ms: 0,
            max_concurrent_invocations: None,
        }
    }
}

impl SchedulerConfig {
    pub fn to_scheduler_config(&self) -> CommandSchedulerConfig {
        let config = CommandSchedulerConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_command_file_reload(self.command_file_reload)
            .with_default_min_loop_time(Duration::from_millis(self.default_min_loop_time_ms));
        match self.max_concurrent_invocations {
            Some(max) => config.with_max_concurrent_invocations(max),
            None => config,
        }
    }
}

/// One statically configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub serial: String,
    #[serde(default = "default_kind")]
    pub kind: DeviceKind,
    #[serde(default)]
    pub emulator: bool,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_kind() -> DeviceKind {
    DeviceKind::Real
}

impl DeviceEntry {
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(&self.serial)
            .with_kind(self.kind)
            .with_emulator(self.emulator);
        for (key, value) in &self.properties {
            device.set_property(key, value);
        }
        device
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            scheduler: SchedulerConfig::default(),
            devices: Vec::new(),
            null_devices: 0,
            invocation: ProcessConfig::default(),
            test_catalog: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        if let Some(config_dir) = dirs::config_dir() {
            let project_name = env!("CARGO_PKG_NAME");
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Device pool holding the configured inventory plus generated null devices.
    pub fn build_pool(&self) -> DevicePool {
        let pool = DevicePool::with_devices(self.devices.iter().map(DeviceEntry::to_device));
        if self.null_devices > 0 {
            pool.set_null_device_count(self.null_devices);
        }
        pool
    }

    pub fn test_catalog(&self) -> StaticTestCatalog {
        StaticTestCatalog::new(self.test_catalog.clone())
    }
}
