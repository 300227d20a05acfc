// ABOUTME: wko-supervisor CLI entry point.
// ABOUTME: Provides validate, check, and run subcommands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use wko_supervisor::{run_check, run_supervisor, run_validate, CheckOptions, RunOptions, ValidateOptions};

#[derive(Parser)]
#[command(name = "wko-supervisor")]
#[command(about = "Supervisor for pluggable tool workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file (.json or .toml)
        config: PathBuf,
        /// Optional JSON schema for structural validation
        #[arg(long)]
        schema: Option<PathBuf>,
        /// Print a human-readable report instead of JSON
        #[arg(long)]
        report: bool,
    },
    /// Dry-run one worker's launch command without starting it
    Check {
        /// Path to configuration file
        config: PathBuf,
        /// Worker id
        worker: String,
    },
    /// Start all workers and supervise them until interrupted
    Run {
        /// Path to configuration file
        #[arg(long, env = "WKO_SUPERVISOR_CONFIG")]
        config: Option<PathBuf>,
        /// Optional JSON schema for structural validation
        #[arg(long)]
        schema: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    wko_log::init_for("wko_supervisor");

    let cli = Cli::parse();

    let ok = match cli.command {
        Commands::Validate {
            config,
            schema,
            report,
        } => run_validate(ValidateOptions {
            config_path: config,
            schema_path: schema,
            report,
        })?,
        Commands::Check { config, worker } => {
            run_check(CheckOptions {
                config_path: config,
                worker,
            })
            .await?
        }
        Commands::Run { config, schema } => {
            run_supervisor(RunOptions {
                config_path: config,
                schema_path: schema,
            })
            .await?;
            true
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
