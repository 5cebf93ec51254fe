use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cmdsched::command::{ArgsConfigurationFactory, CommandFileParser, CommandSplitter, CommandTracker};
use cmdsched::device::{Device, FreeDeviceState};
use cmdsched::id::CommandIdGenerator;
use cmdsched::invocation::{InvocationListener, ProcessInvocation, TerribleFailureHandler};
use cmdsched::scheduler::CommandScheduler;
use cmdsched::watcher::CommandFileWatcher;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::Config;

fn setup_logging(log_stderr: bool, level: Option<&str>) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level.unwrap_or("info"));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    if log_stderr {
        builder.target(env_logger::Target::Stderr).init();
        return Ok(());
    }

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cmdsched")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("cmdsched.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Prints invocation progress to the console.
struct ConsoleListener {
    verbose: bool,
}

impl InvocationListener for ConsoleListener {
    fn invocation_started(&self, tracker: &CommandTracker, device: &Device) {
        println!(
            "{} [{}] {} on {}",
            "▶".cyan(),
            tracker.id(),
            tracker.command_line(),
            device.serial().bold()
        );
    }

    fn invocation_complete(&self, device: &Device, free_state: FreeDeviceState) {
        if self.verbose || free_state != FreeDeviceState::Available {
            println!("{} {} freed as {:?}", "■".cyan(), device.serial(), free_state);
        }
    }

    fn command_failed(&self, args: &[String], error: &str) {
        println!("{} {}: {}", "✗".red(), args.join(" "), error);
    }
}

struct ConsoleFailureHandler;

impl TerribleFailureHandler for ConsoleFailureHandler {
    fn on_terrible_failure(&self, message: &str) {
        log::error!("Terrible failure: {}", message);
        eprintln!("{} {}", "Fatal:".red().bold(), message);
    }
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            cmdfiles,
            reload,
            extra_args,
            args,
        } => handle_run_command(cmdfiles, *reload, extra_args, args, cli.is_verbose(), config).await,
        Commands::ListDevices { json } => handle_list_devices_command(*json, config),
        Commands::Split { shards, json, args } => handle_split_command(*shards, *json, args, config),
        Commands::CheckFile { path, json } => handle_check_file_command(path, *json),
    }
}

async fn handle_run_command(
    cmdfiles: &[PathBuf],
    reload: bool,
    extra_args: &[String],
    args: &[String],
    verbose: bool,
    config: &Config,
) -> Result<()> {
    if cmdfiles.is_empty() && args.is_empty() {
        return Err(eyre!("Nothing to run: pass a command after `--` or use --cmdfile"));
    }

    let pool = Arc::new(config.build_pool());
    if pool.is_empty() {
        println!("{}", "No devices configured; commands will wait for a device".yellow());
    }

    let mut scheduler_config = config.scheduler.to_scheduler_config();
    if reload {
        scheduler_config = scheduler_config.with_command_file_reload(true);
    }
    let reload = scheduler_config.command_file_reload;

    let scheduler = Arc::new(
        CommandScheduler::new(
            pool.clone(),
            Arc::new(ArgsConfigurationFactory::new()),
            Arc::new(ProcessInvocation::new(config.invocation.clone())),
        )
        .with_config(scheduler_config)
        .with_test_catalog(Arc::new(config.test_catalog()))
        .with_listener(Arc::new(ConsoleListener { verbose }))
        .with_failure_handler(Arc::new(ConsoleFailureHandler)),
    );
    scheduler.start();

    for path in cmdfiles {
        let added = scheduler
            .add_command_file(path, extra_args)
            .context(format!("Failed to load command file {}", path.display()))?;
        println!("Loaded {} commands from {}", added, path.display());
    }

    if !args.is_empty() {
        let queued = scheduler.add_command(args.to_vec()).context("Failed to add command")?;
        if !queued {
            info!("Command was not queued: {}", args.join(" "));
        }
    }

    let watcher = reload.then(|| {
        let interval = Duration::from_millis(config.scheduler.reload_poll_interval_ms);
        CommandFileWatcher::new(&scheduler, interval).spawn()
    });

    tokio::select! {
        _ = scheduler.shutdown_on_empty() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "Interrupted, shutting down".yellow());
            scheduler.shutdown();
        }
    }
    scheduler.join().await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let remaining = scheduler.all_commands_size();
    if remaining > 0 {
        println!("{} commands left unscheduled:", remaining);
        println!("{}", scheduler.display_commands());
    }
    println!(
        "{} {} available, {} unavailable",
        "Done:".green(),
        pool.available_count(),
        pool.unavailable_count()
    );
    Ok(())
}

fn handle_list_devices_command(json: bool, config: &Config) -> Result<()> {
    info!("Listing devices");
    let pool = config.build_pool();

    if json {
        let devices: Vec<_> = pool
            .snapshot()
            .into_iter()
            .map(|(serial, state)| {
                serde_json::json!({
                    "serial": serial,
                    "state": state,
                    "device": pool.device(&serial),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if pool.is_empty() {
        println!("{}", "No devices configured".yellow());
        return Ok(());
    }

    for (serial, state) in pool.snapshot() {
        let Some(device) = pool.device(&serial) else {
            continue;
        };
        let mut line = format!("{:<24} {:<6} {}", serial, device.kind().to_string(), state);
        if device.is_emulator() {
            line.push_str(" emulator");
        }
        if let Some(product) = device.product_type() {
            line.push_str(&format!(" product={}", product));
        }
        println!("{}", line);
    }
    Ok(())
}

fn handle_split_command(shards: u32, json: bool, args: &[String], config: &Config) -> Result<()> {
    info!("Splitting command into {} shards", shards);
    let ids = Arc::new(CommandIdGenerator::new());
    let splitter = CommandSplitter::new(
        Arc::new(ArgsConfigurationFactory::new()),
        Arc::new(config.test_catalog()),
        ids.clone(),
    );
    let tracker = CommandTracker::new(ids.next_id(), args.to_vec(), None);

    let Some(split) = splitter.split(shards, &tracker).context("Failed to split command")? else {
        if json {
            println!("null");
        } else {
            println!("{}", "Command is not shardable".yellow());
        }
        return Ok(());
    };

    if json {
        let shard_args: Vec<&[String]> = split.iter().map(CommandTracker::args).collect();
        println!("{}", serde_json::to_string_pretty(&shard_args)?);
        return Ok(());
    }

    for (index, shard) in split.iter().enumerate() {
        println!("{} {}", format!("[{}]", index).cyan(), shard.command_line());
    }
    Ok(())
}

fn handle_check_file_command(path: &Path, json: bool) -> Result<()> {
    info!("Checking command file {}", path.display());
    let parsed = CommandFileParser::new()
        .parse_file(path)
        .context(format!("Invalid command file {}", path.display()))?;

    if json {
        let commands: Vec<_> = parsed
            .commands
            .iter()
            .map(|line| {
                serde_json::json!({
                    "file": line.file,
                    "line": line.line_number,
                    "args": line.args,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&commands)?);
        return Ok(());
    }

    for line in &parsed.commands {
        println!(
            "{}:{}: {}",
            line.file.display().to_string().dimmed(),
            line.line_number,
            line.args.join(" ")
        );
    }
    for included in &parsed.included_files {
        println!("{} {}", "included".dimmed(), included.display());
    }
    println!("{} {} commands", "OK:".green(), parsed.commands.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(cli.log_stderr, config.log_level.as_deref()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    run_application(&cli, &config)
        .await
        .context("Application failed")?;

    Ok(())
}
