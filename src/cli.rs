//! Command-line interface for devstack.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::orchestrator::Action;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for an `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "0" | "off" => LevelFilter::OFF,
            "1" | "error" | "err" => LevelFilter::ERROR,
            "2" | "warn" | "warning" => LevelFilter::WARN,
            "3" | "info" => LevelFilter::INFO,
            "4" | "debug" => LevelFilter::DEBUG,
            "5" | "trace" => LevelFilter::TRACE,
            other if other.parse::<u8>().is_ok() => {
                return Err(format!(
                    "unsupported log level number '{other}' (expected 0-5)"
                ));
            }
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for devstack.
#[derive(Parser, Debug)]
#[command(name = "devstack", version)]
#[command(
    about = "Start, stop and inspect the local MySQL, PHP, Nginx, SSL and Mailpit stack",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Environment root (defaults to $DEVSTACK_ROOT, then the current directory).
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// Env file with service settings (defaults to `<root>/.env`).
    #[arg(long, value_name = "FILE", global = true)]
    pub env_file: Option<PathBuf>,

    /// Tunables file (defaults to `<root>/devstack.yaml`).
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// The command to execute; `start` when omitted.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// The lifecycle action requested on the command line.
    pub fn action(&self) -> Action {
        match self.command {
            None | Some(Commands::Start) => Action::Start,
            Some(Commands::Stop) => Action::Stop,
            Some(Commands::Restart) => Action::Restart,
            Some(Commands::Status) => Action::Status,
        }
    }
}

/// Available commands for devstack.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Start all services.
    Start,
    /// Stop all services.
    Stop,
    /// Restart all services.
    Restart,
    /// Show status of all services.
    Status,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
