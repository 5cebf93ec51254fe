// Process invocation
// Runs each command as a host process bound to one device

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::command::Configuration;
use crate::device::{Device, DeviceState};
use crate::error::InvocationError;
use crate::invocation::traits::{Invocation, Rescheduler};

/// Environment variable carrying the allocated device's serial.
pub const DEVICE_SERIAL_ENV: &str = "DEVICE_SERIAL";

/// Exit code a runner uses to report a lost device (EX_TEMPFAIL).
pub const DEFAULT_DEVICE_LOST_EXIT_CODE: i32 = 75;

/// Configuration for a process invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// Program to execute
    pub program: String,
    /// Arguments placed before the command's own arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Timeout in milliseconds, 0 for none
    pub timeout_ms: u64,
    /// Exit code meaning the device went away
    pub device_lost_exit_code: i32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: "echo".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            timeout_ms: 0,
            device_lost_exit_code: DEFAULT_DEVICE_LOST_EXIT_CODE,
        }
    }
}

impl ProcessConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn device_lost_exit_code(mut self, code: i32) -> Self {
        self.device_lost_exit_code = code;
        self
    }
}

/// Invocation that runs `program args... <command args...>` per command.
///
/// A non-zero exit is an ordinary test failure. The configured device-lost
/// exit code marks the device unavailable, and failing to start the
/// process at all is a host error.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvocation {
    config: ProcessConfig,
}

impl ProcessInvocation {
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    fn command(&self, device: &Device, config: &Configuration) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args).args(&config.args);
        cmd.env(DEVICE_SERIAL_ENV, device.serial());
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Invocation for ProcessInvocation {
    async fn invoke(
        &self,
        device: &mut Device,
        config: &Configuration,
        _rescheduler: &Rescheduler,
    ) -> Result<(), InvocationError> {
        let child = self.command(device, config).spawn().map_err(|e| {
            InvocationError::FatalHost(format!("cannot start '{}': {}", self.config.program, e))
        })?;

        let waited = if self.config.timeout_ms == 0 {
            child.wait_with_output().await
        } else {
            let timeout = Duration::from_millis(self.config.timeout_ms);
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(InvocationError::Other(format!(
                        "command timed out after {}ms",
                        self.config.timeout_ms
                    )));
                }
            }
        };
        let output = waited.map_err(|e| InvocationError::Other(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            tracing::debug!(serial = %device.serial(), "{}", line);
        }

        match output.status.code() {
            Some(0) => Ok(()),
            Some(code) if code == self.config.device_lost_exit_code => {
                device.set_state(DeviceState::NotAvailable);
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(InvocationError::device_not_available(device.serial(), stderr.trim()))
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(
                    serial = %device.serial(),
                    config = %config.name,
                    exit_code = ?code,
                    stderr = %stderr.trim(),
                    "Tests failed"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ArgsConfigurationFactory, ConfigurationFactory};
    use crate::device::DeviceSelectionSpec;
    use tokio::sync::mpsc;

    fn config(s: &str) -> Configuration {
        let args: Vec<String> = s.split_whitespace().map(String::from).collect();
        ArgsConfigurationFactory::new()
            .create_configuration_from_args(&args)
            .unwrap()
    }

    fn rescheduler() -> Rescheduler {
        let (tx, _rx) = mpsc::unbounded_channel();
        Rescheduler::new(tx, DeviceSelectionSpec::default(), None)
    }

    fn sh(script: &str) -> ProcessInvocation {
        ProcessInvocation::new(ProcessConfig::new("sh").arg("-c").arg(script))
    }

    #[test]
    fn test_process_config_builder() {
        let config = ProcessConfig::new("runner")
            .arg("--verbose")
            .env("A", "1")
            .timeout_ms(500)
            .device_lost_exit_code(3);
        assert_eq!(config.program, "runner");
        assert_eq!(config.args, vec!["--verbose"]);
        assert_eq!(config.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.device_lost_exit_code, 3);
    }

    #[tokio::test]
    async fn test_success() {
        let mut device = Device::new("SER1");
        let result = sh(r#"[ "$DEVICE_SERIAL" = SER1 ] || exit 75"#)
            .invoke(&mut device, &config("instrument"), &rescheduler())
            .await;
        assert!(result.is_ok());
        assert_eq!(device.state(), DeviceState::Online);
    }

    #[tokio::test]
    async fn test_test_failure_is_not_error() {
        let mut device = Device::new("SER1");
        let result = sh("exit 1")
            .invoke(&mut device, &config("instrument"), &rescheduler())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_device_lost_exit_code() {
        let mut device = Device::new("SER1");
        let result = sh("echo offline >&2; exit 75")
            .invoke(&mut device, &config("instrument"), &rescheduler())
            .await;
        assert_eq!(
            result,
            Err(InvocationError::device_not_available("SER1", "offline"))
        );
        assert_eq!(device.state(), DeviceState::NotAvailable);
    }

    #[tokio::test]
    async fn test_command_args_appended() {
        // sh -c sees the command arguments as $0 $1 ...
        let mut device = Device::new("SER1");
        let result = sh(r#"[ "$0" = instrument ] && [ "$1" = --loop ] || exit 75"#)
            .invoke(&mut device, &config("instrument --loop"), &rescheduler())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let mut device = Device::new("SER1");
        let invocation = ProcessInvocation::new(ProcessConfig::new("/nonexistent/runner"));
        let result = invocation
            .invoke(&mut device, &config("instrument"), &rescheduler())
            .await;
        assert!(matches!(result, Err(InvocationError::FatalHost(_))));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut device = Device::new("SER1");
        let invocation = ProcessInvocation::new(ProcessConfig::new("sh").arg("-c").arg("sleep 5").timeout_ms(50));
        let result = invocation
            .invoke(&mut device, &config("instrument"), &rescheduler())
            .await;
        assert!(matches!(result, Err(InvocationError::Other(ref m)) if m.contains("timed out")));
    }
}
