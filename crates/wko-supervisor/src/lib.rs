// ABOUTME: wko-supervisor library: port pool, worker lifecycle, health monitor and capabilities.
// ABOUTME: Also hosts the validate/check/run command implementations used by the CLI.

pub mod capability;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod ports;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod worker;

pub use capability::{invoke_remote_tool, Capability};
pub use error::SupervisorError;
pub use health::{HealthMonitor, MonitorOptions, PassSummary};
pub use lifecycle::{LifecycleOutcome, Supervisor, SupervisorOptions};
pub use ports::PortAllocator;
pub use process::{OutputLine, OutputLog, Stream};
pub use rpc::{Connector, HttpConnector, HttpToolClient, ToolClient, ToolInfo, ToolOutput};
pub use worker::{HealthState, WorkerState, WorkerStatus};

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use wko_supervisor_core::{
    load_document, render_report, validate_server_executable, ConfigValidator, SupervisorConfig,
};

/// Options for `validate`
pub struct ValidateOptions {
    pub config_path: PathBuf,
    pub schema_path: Option<PathBuf>,
    /// Print the human-readable report instead of JSON
    pub report: bool,
}

/// Options for `check`
pub struct CheckOptions {
    pub config_path: PathBuf,
    pub worker: String,
}

/// Options for `run`
pub struct RunOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
}

fn validator_for(schema_path: Option<&PathBuf>) -> ConfigValidator {
    match schema_path {
        Some(path) => ConfigValidator::from_schema_path(path),
        None => ConfigValidator::new(),
    }
}

/// Validate a configuration file and print the report. Returns whether it is valid.
pub fn run_validate(options: ValidateOptions) -> Result<bool> {
    let document = load_document(&options.config_path)
        .with_context(|| format!("loading {}", options.config_path.display()))?;
    let validator = validator_for(options.schema_path.as_ref());
    let report = validator.validate_config(&document);

    if options.report {
        let workers = wko_supervisor_core::config::worker_section(&document)
            .map(|w| w.len())
            .unwrap_or(0);
        println!("{}", render_report(workers, &report));
    } else {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report")?
        );
    }

    Ok(report.valid)
}

/// Dry-run one worker's launch command. Returns whether it can start.
pub async fn run_check(options: CheckOptions) -> Result<bool> {
    let config = SupervisorConfig::load(&options.config_path, &ConfigValidator::new())
        .with_context(|| format!("loading {}", options.config_path.display()))?;

    if let Some(rejected) = config.rejection(&options.worker) {
        anyhow::bail!(
            "worker {} is rejected: {}",
            rejected.id,
            rejected.reasons.join("; ")
        );
    }
    let worker = config
        .worker(&options.worker)
        .with_context(|| format!("unknown worker: {}", options.worker))?;

    let check = validate_server_executable(worker).await;
    println!(
        "{}",
        serde_json::to_string_pretty(&check).context("serializing check result")?
    );
    Ok(check.can_start)
}

/// Run the supervisor until Ctrl+C or SIGTERM.
pub async fn run_supervisor(options: RunOptions) -> Result<()> {
    let config_path = options
        .config_path
        .unwrap_or_else(SupervisorConfig::default_path);
    let validator = validator_for(options.schema_path.as_ref());
    let config = SupervisorConfig::load(&config_path, &validator)
        .with_context(|| format!("loading {}", config_path.display()))?;

    tracing::info!(
        config = %config_path.display(),
        workers = config.workers.len(),
        rejected = config.rejected.len(),
        "Starting supervisor"
    );

    let supervisor = Arc::new(Supervisor::new(config, Arc::new(HttpConnector::default())));
    let started = supervisor.start_all().await;
    for (id, ok) in &started {
        if !ok {
            tracing::warn!(worker = %id, "Worker did not start");
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&supervisor.statuses()).context("serializing status")?
    );

    let mut monitor = HealthMonitor::spawn(Arc::clone(&supervisor), MonitorOptions::default());

    shutdown_signal().await;

    supervisor.shutdown(&mut monitor).await;
    tracing::info!("Supervisor shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
