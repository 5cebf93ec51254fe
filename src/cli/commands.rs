//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - run: start the scheduler, submit commands and wait for them
//! - list-devices: show the configured device inventory
//! - split: preview how a command would be sharded
//! - check-file: expand a command file without running it

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// cmdsched - schedules test commands onto a pool of devices
#[derive(Parser, Debug)]
#[command(name = "cmdsched")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub log_stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run commands on the configured devices until the queue drains
    Run {
        /// Command file to load (repeatable)
        #[arg(long = "cmdfile", value_name = "PATH")]
        cmdfiles: Vec<PathBuf>,

        /// Reload command files when they change
        #[arg(long)]
        reload: bool,

        /// Extra arguments appended to every command file line
        #[arg(long = "extra-arg", value_name = "ARG", allow_hyphen_values = true)]
        extra_args: Vec<String>,

        /// Command to run, after `--`
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List the configured devices
    ListDevices {
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a command would be split into shards
    Split {
        /// Desired number of shards
        #[arg(short, long)]
        shards: u32,

        /// Print JSON
        #[arg(long)]
        json: bool,

        /// Command to split, after `--`
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Parse a command file and print the expanded commands
    CheckFile {
        /// Command file path
        path: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["cmdsched"]).is_err());
    }

    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::try_parse_from(["cmdsched", "-v", "--log-stderr", "-c", "/etc/cmdsched.yml", "list-devices"])
            .unwrap();
        assert!(cli.is_verbose());
        assert!(cli.log_stderr);
        assert_eq!(cli.config.as_ref(), Some(&PathBuf::from("/etc/cmdsched.yml")));
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from([
            "cmdsched",
            "run",
            "--cmdfile",
            "a.txt",
            "--cmdfile",
            "b.txt",
            "--reload",
            "--",
            "instrument",
            "--loop",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                cmdfiles,
                reload,
                extra_args,
                args,
            } => {
                assert_eq!(cmdfiles, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
                assert!(reload);
                assert!(extra_args.is_empty());
                assert_eq!(args, vec!["instrument", "--loop"]);
            }
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_run_extra_args() {
        let cli = Cli::try_parse_from(["cmdsched", "run", "--cmdfile", "a.txt", "--extra-arg", "--null-device"]).unwrap();
        match cli.command {
            Commands::Run { extra_args, .. } => assert_eq!(extra_args, vec!["--null-device"]),
            _ => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_list_devices_json() {
        let cli = Cli::try_parse_from(["cmdsched", "list-devices", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListDevices { json: true }));
    }

    #[test]
    fn test_split_command() {
        let cli = Cli::try_parse_from(["cmdsched", "split", "--shards", "3", "--", "host", "--class", "a.B"]).unwrap();
        match cli.command {
            Commands::Split { shards, json, args } => {
                assert_eq!(shards, 3);
                assert!(!json);
                assert_eq!(args, vec!["host", "--class", "a.B"]);
            }
            _ => panic!("Expected split command"),
        }
    }

    #[test]
    fn test_split_requires_args() {
        assert!(Cli::try_parse_from(["cmdsched", "split", "--shards", "3"]).is_err());
    }

    #[test]
    fn test_check_file_command() {
        let cli = Cli::try_parse_from(["cmdsched", "check-file", "cmds.txt"]).unwrap();
        match cli.command {
            Commands::CheckFile { path, json } => {
                assert_eq!(path, PathBuf::from("cmds.txt"));
                assert!(!json);
            }
            _ => panic!("Expected check-file command"),
        }
    }

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }
}
