use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coord_common::process_utils::OsProcessTable;
use coord_common::CoordConfig;
use coordd::control::{get_setting, set_setting};
use coordd::worker::{CommandBackend, WorkerBackend};
use coordd::{ExitKind, InstanceOptions};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coordd", version, about = "Coordinate instances of a tool on this host")]
struct Cli {
    /// Rendezvous name shared by all instances (or COORD_RENDEZVOUS)
    #[arg(long)]
    name: Option<String>,

    /// Path to a TOML configuration file (or COORD_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared settings file owned by the primary
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Working directory for the worker process
    #[arg(long)]
    working_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Worker command line, after `--`
    #[arg(last = true)]
    worker: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a shared setting as JSON
    Get { key: String },
    /// Set a shared setting; VALUE is parsed as JSON, falling back to a string
    Set { key: String, value: String },
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match log_file {
        Some(path) => {
            let file: File = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Forward SIGINT and SIGTERM, every occurrence, as one message each.
fn spawn_signal_forwarder() -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    let ctrl_c_tx = tx.clone();
    tokio::spawn(async move {
        while signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            if ctrl_c_tx.send(()).is_err() {
                break;
            }
        }
    });

    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::spawn(async move {
                while sigterm.recv().await.is_some() {
                    info!("Received SIGTERM");
                    if tx.send(()).is_err() {
                        break;
                    }
                }
            });
        }
        Err(err) => warn!("Failed to install SIGTERM handler: {}", err),
    }

    rx
}

fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn run_command(options: &InstanceOptions, command: Command) -> Result<()> {
    match command {
        Command::Get { key } => match get_setting(options, &key).await? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("setting '{}' not found", key),
        },
        Command::Set { key, value } => {
            let version = set_setting(options, &key, parse_value(&value)).await?;
            println!("{} set (version {})", key, version);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = CoordConfig::load(cli.config.as_deref());
    let debug = cli.debug || config.as_ref().map(|c| c.debug).unwrap_or(false);
    if let Err(err) = init_logging(debug, cli.log_file.as_deref()) {
        eprintln!("coordd: {:#}", err);
        return ExitKind::Fatal.into();
    }

    let mut config = match config {
        Ok(config) => config,
        Err(err) => {
            error!("{:#}", err);
            return ExitKind::Fatal.into();
        }
    };
    for warning in config.warnings.drain(..) {
        warn!("{}", warning);
    }
    if let Some(name) = cli.name {
        config.rendezvous = name;
    }
    if let Some(settings) = cli.settings {
        config.settings_file = settings;
    }
    config.debug = debug;

    let working_dir = match cli.working_dir {
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let backend = CommandBackend::from_command(&cli.worker, config.disable_path_rewrite)
        .map(|backend| Arc::new(backend) as Arc<dyn WorkerBackend>);

    let options = InstanceOptions {
        config,
        working_dir,
        backend,
        process_table: Arc::new(OsProcessTable),
    };

    if let Some(command) = cli.command {
        return match run_command(&options, command).await {
            Ok(()) => ExitKind::Normal.into(),
            Err(err) => {
                error!("{:#}", err);
                ExitKind::Fatal.into()
            }
        };
    }

    info!(
        "{}",
        coord_build_info::formatted_banner("coordd", env!("CARGO_PKG_VERSION"))
    );
    info!(
        build = coord_build_info::build_id(),
        rendezvous = %options.config.rendezvous,
        runtime_dir = %options.config.runtime_dir.display(),
        settings = %options.config.settings_file.display(),
        worker = options.backend.is_some(),
        "Starting instance"
    );

    let signals = spawn_signal_forwarder();
    coordd::run(options, signals).await.into()
}
