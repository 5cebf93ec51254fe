//! Error types for cmdsched
//!
//! Centralized error handling using thiserror.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while turning an argument vector into a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The argument vector could not be parsed
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// No configuration name was supplied
    #[error("Missing configuration name")]
    MissingConfigName,

    /// An option carried a value that could not be interpreted
    #[error("Invalid value '{value}' for option {option}")]
    InvalidValue { option: String, value: String },
}

/// Errors an invocation may report back to its executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The device stopped responding while the invocation was running
    #[error("Device {serial} not available: {message}")]
    DeviceNotAvailable { serial: String, message: String },

    /// The host itself is in an unrecoverable state
    #[error("Fatal host error: {0}")]
    FatalHost(String),

    /// Anything else the invocation could not handle
    #[error("Invocation error: {0}")]
    Other(String),
}

impl InvocationError {
    /// Shorthand for a lost device.
    pub fn device_not_available(serial: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceNotAvailable {
            serial: serial.into(),
            message: message.into(),
        }
    }
}

/// All error types that can occur in the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A command's argument vector was rejected
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// A command file could not be read or expanded
    #[error("Command file {path}: {message}")]
    CommandFile { path: PathBuf, message: String },

    /// The scheduler no longer accepts work
    #[error("Scheduler is shutting down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn command_file(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CommandFile {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_args_error() {
        let err = ConfigurationError::InvalidArgs("unexpected argument '--bogus'".to_string());
        assert_eq!(err.to_string(), "Invalid arguments: unexpected argument '--bogus'");
    }

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigurationError::InvalidValue {
            option: "--property".to_string(),
            value: "novalue".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid value 'novalue' for option --property");
    }

    #[test]
    fn test_device_not_available_error() {
        let err = InvocationError::device_not_available("SER1", "adb went away");
        assert_eq!(err.to_string(), "Device SER1 not available: adb went away");
    }

    #[test]
    fn test_configuration_error_conversion() {
        let err: SchedulerError = ConfigurationError::MissingConfigName.into();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert_eq!(err.to_string(), "Configuration error: Missing configuration name");
    }

    #[test]
    fn test_command_file_error() {
        let err = SchedulerError::command_file("/tmp/cmds.txt", "unterminated quote");
        assert_eq!(err.to_string(), "Command file /tmp/cmds.txt: unterminated quote");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SchedulerError = io_err.into();
        assert!(matches!(err, SchedulerError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(SchedulerError::Shutdown)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }
}
