//! Snapline CLI - transactional snapshot commits for versioned tables.

use anyhow::Result;
use clap::{Parser, Subcommand};
use snapline_core::config::LogFormat;
use snapline_core::{Config, ErrorKind};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Lost a race with another writer; retry from a fresh base
    ConcurrentModification = 2,
    /// The request is invalid and must change
    ValidationError = 3,
    /// The requested change has no defined semantics
    UnsupportedOperation = 4,
    /// Storage, I/O or journal failure
    InfrastructureError = 5,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error onto an exit code through its [`ErrorKind`].
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<snapline_core::Error>() {
            return match e {
                snapline_core::Error::Config(_) => ExitCode::ConfigError,
                _ => match e.kind() {
                    ErrorKind::ConcurrentModification => ExitCode::ConcurrentModification,
                    ErrorKind::Validation => ExitCode::ValidationError,
                    ErrorKind::UnsupportedOperation => ExitCode::UnsupportedOperation,
                    ErrorKind::Infrastructure => ExitCode::InfrastructureError,
                },
            };
        }
        if error.downcast_ref::<toml::de::Error>().is_some() {
            return ExitCode::ConfigError;
        }
        ExitCode::RuntimeError
    }
}

mod commands;

#[derive(Parser)]
#[command(name = "snapline")]
#[command(about = "Transactional snapshot commits for versioned tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Table location; overrides the configuration file
    #[arg(short, long, global = true)]
    location: Option<String>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a table from a schema JSON file
    Init {
        /// Schema JSON file
        #[arg(long)]
        schema: PathBuf,

        /// Table property, repeatable (key=value)
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Apply a JSON change-set file
    Commit {
        /// Change-set JSON file
        changes: PathBuf,
    },

    /// Show snapshot history
    History {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Expire old snapshots
    ExpireSnapshots {
        /// Show what would expire without changing the table
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete unreferenced files
    CleanOrphans {
        /// Only files older than this are deleted (milliseconds)
        #[arg(long)]
        older_than_ms: Option<u64>,

        /// List orphans without deleting them
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the configuration and, when it exists, the table
    Validate,
}

fn parse_property(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config, cli.location.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::ConfigError;
        }
    };

    // Initialize logging
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(config.monitoring.log_level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match config.monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli.command, config).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Init { schema, properties } => {
            commands::table::init(config, &schema, properties.into_iter().collect()).await?;
        }

        Commands::Commit { changes } => {
            commands::table::commit(config, &changes).await?;
        }

        Commands::History { json } => {
            commands::table::history(config, json).await?;
        }

        Commands::ExpireSnapshots { dry_run } => {
            commands::maintenance::expire_snapshots(config, dry_run).await?;
        }

        Commands::CleanOrphans {
            older_than_ms,
            dry_run,
        } => {
            commands::maintenance::clean_orphans(config, older_than_ms, dry_run).await?;
        }

        Commands::Validate => {
            commands::table::validate(config).await?;
        }
    }

    Ok(())
}

/// Load the configuration file, or build one from `--location` alone.
fn load_config(path: &Option<PathBuf>, location: Option<&str>) -> Result<Config> {
    let default_path = PathBuf::from("snapline.toml");
    let path = match path {
        Some(path) => Some(path.clone()),
        None if default_path.exists() => Some(default_path),
        None => None,
    };

    let mut config = match (path, location) {
        (Some(path), _) => Config::from_file(&path)?,
        (None, Some(location)) => Config::for_location(location),
        (None, None) => anyhow::bail!(
            "no configuration: pass --config, --location or create snapline.toml"
        ),
    };
    if let Some(location) = location {
        config.table.location = location.to_string();
    }
    Ok(config)
}
