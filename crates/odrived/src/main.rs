//! odrived: odrive storage node
//!
//! Usage:
//!   odrived [--config /etc/odrive/odrive.toml] [run]
//!   odrived stats
//!   odrived gen-key
//!   odrived rotate-key --new-key-file <path>
//!
//! Commands:
//!   run        - Cache, drain workers, eviction, janitor, peer endpoint [default]
//!   stats      - Print local partition statistics as JSON and exit
//!   gen-key    - Print a fresh hex master key and exit
//!   rotate-key - Re-MAC every permission row under a new master key (node stopped)

mod daemon;
mod keys;
mod metrics;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use odrive_core::config::OdriveConfig;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "odrived", version, about = "odrive encrypted object store node")]
struct Cli {
    /// Path to odrive.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "ODRIVE_CONFIG",
        default_value = "/etc/odrive/odrive.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, env = "ODRIVE_LOG")]
    log: Option<String>,

    /// Log format (json, text)
    #[arg(long, env = "ODRIVE_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Run the node (default)
    Run,
    /// Print per-state partition counts and byte usage
    Stats,
    /// Generate a random 256-bit master key
    GenKey,
    /// Migrate stored permission rows to a new master key
    RotateKey {
        /// File holding the new hex master key
        #[arg(long)]
        new_key_file: PathBuf,
    },
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    fn from_config(s: &str) -> Self {
        if s.eq_ignore_ascii_case("text") {
            LogFormat::Text
        } else {
            LogFormat::Json
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Command::Run);

    if command == Command::GenKey {
        println!("{}", keys::generate_hex());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    let level = cli.log.clone().unwrap_or_else(|| config.daemon.log_level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| LogFormat::from_config(&config.daemon.log_format));
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = ?command,
        config = %cli.config.display(),
        "odrived starting"
    );

    match command {
        Command::Run => daemon::run(config).await,
        Command::Stats => daemon::print_stats(config).await,
        Command::RotateKey { new_key_file } => daemon::rotate_key(config, &new_key_file).await,
        Command::GenKey => unreachable!("handled before logging is set up"),
    }
}

fn load_config(path: &Path) -> Result<OdriveConfig> {
    OdriveConfig::load(path).with_context(|| format!("loading config {}", path.display()))
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
