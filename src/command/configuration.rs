//! Runnable configurations and the factory that builds them from arguments.
//!
//! The scheduler treats argument vectors as opaque and asks a
//! [`ConfigurationFactory`] for everything it needs: device constraints,
//! run mode and the test target used for sharding. A fresh [`Configuration`]
//! is built for every attempt so no mutable state is shared between runs.

use std::time::Duration;

use clap::{CommandFactory, Parser};
use serde::Serialize;

use crate::command::options::{CommandOptions, ShardUnit};
use crate::device::DeviceSelectionSpec;
use crate::error::ConfigurationError;

/// Tests a configuration targets, as far as sharding needs to know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestTarget {
    pub classes: Vec<String>,
    /// Restrict a single class to one method.
    pub method: Option<String>,
    /// `Class` or `Class#method` entries to keep; empty keeps everything.
    pub include_filters: Vec<String>,
    /// `Class` or `Class#method` entries to drop.
    pub exclude_filters: Vec<String>,
    pub shard_unit: ShardUnit,
    pub runtime_hint: Duration,
}

/// A parsed, validated command ready to be handed to an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Configuration {
    pub name: String,
    /// The argument vector this configuration was built from.
    pub args: Vec<String>,
    pub command_options: CommandOptions,
    pub device_requirements: DeviceSelectionSpec,
    pub test_target: TestTarget,
    /// Arguments after `--`, passed through to the invocation untouched.
    pub passthrough: Vec<String>,
}

impl Configuration {
    /// Cross-option checks that clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.command_options.shard_count == Some(0) {
            return Err(ConfigurationError::InvalidValue {
                option: "--shard-count".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(method) = &self.test_target.method
            && self.test_target.classes.is_empty()
        {
            return Err(ConfigurationError::InvalidValue {
                option: "--method".to_string(),
                value: method.clone(),
            });
        }
        Ok(())
    }

    /// Render a canonical argument vector that parses back to this configuration.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name.clone()];
        let options = &self.command_options;
        let spec = &self.device_requirements;
        let target = &self.test_target;

        if options.loop_mode {
            args.push("--loop".into());
        }
        if !options.min_loop_time.is_zero() {
            push_opt(&mut args, "--min-loop-time", options.min_loop_time.as_millis());
        }
        if let Some(count) = options.max_run_count {
            push_opt(&mut args, "--max-run-count", count);
        }
        if options.dry_run {
            args.push("--dry-run".into());
        }
        if options.help_mode {
            args.push("--help".into());
        }
        for serial in &spec.serials {
            push_opt(&mut args, "--serial", serial);
        }
        for serial in &spec.exclude_serials {
            push_opt(&mut args, "--exclude-serial", serial);
        }
        for product in &spec.product_types {
            push_opt(&mut args, "--product-type", product);
        }
        for product in &spec.product_device_types {
            push_opt(&mut args, "--product-device-type", product);
        }
        for (key, value) in &spec.properties {
            push_opt(&mut args, "--property", format!("{}={}", key, value));
        }
        if spec.emulator_requested {
            args.push("--emulator".into());
        }
        if spec.null_device_requested {
            args.push("--null-device".into());
        }
        for class in &target.classes {
            push_opt(&mut args, "--class", class);
        }
        if let Some(method) = &target.method {
            push_opt(&mut args, "--method", method);
        }
        for filter in &target.include_filters {
            push_opt(&mut args, "--include-filter", filter);
        }
        for filter in &target.exclude_filters {
            push_opt(&mut args, "--exclude-filter", filter);
        }
        if target.shard_unit != ShardUnit::Class {
            push_opt(&mut args, "--shard-unit", target.shard_unit);
        }
        if !target.runtime_hint.is_zero() {
            push_opt(&mut args, "--runtime-hint", target.runtime_hint.as_millis());
        }
        if let Some(count) = options.shard_count {
            push_opt(&mut args, "--shard-count", count);
        }
        if !self.passthrough.is_empty() {
            args.push("--".into());
            args.extend(self.passthrough.iter().cloned());
        }
        args
    }
}

fn push_opt(args: &mut Vec<String>, name: &str, value: impl ToString) {
    args.push(name.to_string());
    args.push(value.to_string());
}

/// Builds configurations from argument vectors.
pub trait ConfigurationFactory: Send + Sync {
    /// Parse `args` into a configuration.
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigurationError>;

    /// Print usage for the configuration named in `args`.
    fn print_help(&self, args: &[String]);

    /// Print what a dry run would execute.
    fn print_dry_run(&self, config: &Configuration) {
        println!("Dry run: {}", config.to_args().join(" "));
    }
}

/// Argument grammar understood by [`ArgsConfigurationFactory`].
#[derive(Parser, Debug)]
#[command(
    name = "command",
    no_binary_name = true,
    disable_help_flag = true,
    disable_version_flag = true
)]
struct CommandArgs {
    /// Name of the configuration to run
    config_name: Option<String>,

    /// Re-queue the command after every run
    #[arg(long = "loop")]
    loop_mode: bool,

    /// Minimum milliseconds between loop iteration starts
    #[arg(long, value_name = "MS", default_value_t = 0)]
    min_loop_time: u64,

    /// Stop looping after this many runs
    #[arg(long, value_name = "N")]
    max_run_count: Option<u32>,

    /// Validate and print the command without running it
    #[arg(long)]
    dry_run: bool,

    /// Print usage for the configuration
    #[arg(long = "help")]
    help_mode: bool,

    /// Run only on a device with this serial
    #[arg(long = "serial", value_name = "SERIAL")]
    serials: Vec<String>,

    /// Never run on a device with this serial
    #[arg(long = "exclude-serial", value_name = "SERIAL")]
    exclude_serials: Vec<String>,

    /// Acceptable product type (board name)
    #[arg(long = "product-type", value_name = "TYPE")]
    product_types: Vec<String>,

    /// Acceptable product device name
    #[arg(long = "product-device-type", value_name = "TYPE")]
    product_device_types: Vec<String>,

    /// Required device property, as KEY=VALUE
    #[arg(long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
    properties: Vec<(String, String)>,

    /// Run on an emulator
    #[arg(long)]
    emulator: bool,

    /// Run on a host-only null device
    #[arg(long)]
    null_device: bool,

    /// Test class to run
    #[arg(long = "class", value_name = "CLASS")]
    classes: Vec<String>,

    /// Single test method to run
    #[arg(long, value_name = "METHOD")]
    method: Option<String>,

    /// Keep only tests matching CLASS or CLASS#METHOD
    #[arg(long = "include-filter", value_name = "FILTER")]
    include_filters: Vec<String>,

    /// Drop tests matching CLASS or CLASS#METHOD
    #[arg(long = "exclude-filter", value_name = "FILTER")]
    exclude_filters: Vec<String>,

    /// Shard granularity
    #[arg(long, value_enum, default_value_t = ShardUnit::Class)]
    shard_unit: ShardUnit,

    /// Expected total runtime in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 0)]
    runtime_hint: u64,

    /// Split into this many shards on submission
    #[arg(long, value_name = "N")]
    shard_count: Option<u32>,

    /// Arguments passed through to the invocation
    #[arg(last = true)]
    passthrough: Vec<String>,
}

fn parse_property(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))
}

/// Default factory: parses the argument grammar with clap.
#[derive(Debug, Clone, Default)]
pub struct ArgsConfigurationFactory;

impl ArgsConfigurationFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ConfigurationFactory for ArgsConfigurationFactory {
    fn create_configuration_from_args(&self, args: &[String]) -> Result<Configuration, ConfigurationError> {
        let parsed = CommandArgs::try_parse_from(args).map_err(|e| {
            let rendered = e.render().to_string();
            let first = rendered.lines().next().unwrap_or_default();
            ConfigurationError::InvalidArgs(first.trim_start_matches("error: ").to_string())
        })?;

        let name = match parsed.config_name {
            Some(name) => name,
            // help without a name still needs a configuration to report help mode
            None if parsed.help_mode => String::new(),
            None => return Err(ConfigurationError::MissingConfigName),
        };

        let config = Configuration {
            name,
            args: args.to_vec(),
            command_options: CommandOptions {
                loop_mode: parsed.loop_mode,
                min_loop_time: Duration::from_millis(parsed.min_loop_time),
                max_run_count: parsed.max_run_count,
                dry_run: parsed.dry_run,
                help_mode: parsed.help_mode,
                shard_count: parsed.shard_count,
            },
            device_requirements: DeviceSelectionSpec {
                serials: parsed.serials.into_iter().collect(),
                exclude_serials: parsed.exclude_serials.into_iter().collect(),
                product_types: parsed.product_types.into_iter().collect(),
                product_device_types: parsed.product_device_types.into_iter().collect(),
                properties: parsed.properties.into_iter().collect(),
                emulator_requested: parsed.emulator,
                null_device_requested: parsed.null_device,
            },
            test_target: TestTarget {
                classes: parsed.classes,
                method: parsed.method,
                include_filters: parsed.include_filters,
                exclude_filters: parsed.exclude_filters,
                shard_unit: parsed.shard_unit,
                runtime_hint: Duration::from_millis(parsed.runtime_hint),
            },
            passthrough: parsed.passthrough,
        };

        config.validate()?;
        Ok(config)
    }

    fn print_help(&self, args: &[String]) {
        let name = args.first().filter(|a| !a.starts_with('-'));
        if let Some(name) = name {
            println!("Usage for configuration '{}':", name);
        }
        println!("{}", CommandArgs::command().render_help());
    }
}
