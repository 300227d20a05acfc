// ABOUTME: Background health monitor: probes running workers and restarts ones that keep failing.
// ABOUTME: Runs as a tokio task with a cancellation token; one pass per tick.

use crate::error::SupervisorError;
use crate::lifecycle::Supervisor;
use crate::registry::WorkerSlot;
use crate::worker::WorkerState;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Sleep between passes.
    pub tick: Duration,
    /// Sleep after a pass that panicked.
    pub error_backoff: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(10),
            error_backoff: Duration::from_secs(30),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub probed: usize,
    pub failed: usize,
    pub became_unhealthy: Vec<String>,
    pub restarted: Vec<String>,
}

pub struct HealthMonitor {
    supervisor: Arc<Supervisor>,
    options: MonitorOptions,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self::with_options(supervisor, MonitorOptions::default())
    }

    pub fn with_options(supervisor: Arc<Supervisor>, options: MonitorOptions) -> Self {
        Self {
            supervisor,
            options,
            cancel: None,
            task: None,
        }
    }

    /// Create a monitor and start its loop.
    pub fn spawn(supervisor: Arc<Supervisor>, options: MonitorOptions) -> Self {
        let mut monitor = Self::with_options(supervisor, options);
        monitor.start();
        monitor
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Start the loop. A no-op if it is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            tracing::debug!("Health monitor already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor_loop(
            Arc::clone(&self.supervisor),
            self.options.clone(),
            cancel.clone(),
        ));
        self.cancel = Some(cancel);
        self.task = Some(task);
    }

    /// Stop the loop and wait for the current pass to finish.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Health monitor task ended abnormally");
            }
        }
    }

    /// Run a single pass now.
    pub async fn run_once(&self) -> PassSummary {
        run_pass(&self.supervisor).await
    }
}

async fn monitor_loop(supervisor: Arc<Supervisor>, options: MonitorOptions, cancel: CancellationToken) {
    tracing::info!(tick_secs = options.tick.as_secs(), "Health monitor started");

    loop {
        // Each pass runs as its own task so a panic is contained to that pass.
        let pass = tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { run_pass(&supervisor).await }
        });

        let delay = match pass.await {
            Ok(summary) => {
                if summary.probed > 0 {
                    tracing::debug!(probed = summary.probed, failed = summary.failed, "Health pass complete");
                }
                options.tick
            }
            Err(e) => {
                tracing::error!(error = %e, "Health pass aborted, backing off");
                options.error_backoff
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!("Health monitor stopped");
}

/// Probe every Running worker whose interval has elapsed.
///
/// Workers busy in a lifecycle operation are skipped until the next pass.
async fn run_pass(supervisor: &Supervisor) -> PassSummary {
    let mut summary = PassSummary::default();

    for slot in supervisor.registry().all() {
        if !slot.config.health_check.enabled() {
            continue;
        }
        let Some(_lifecycle) = slot.try_lock_lifecycle() else {
            tracing::debug!(worker = %slot.id, "Worker busy, skipping probe");
            continue;
        };

        let (state, last_check, client) =
            slot.with_record(|r| (r.health.status, r.health.last_check, r.client.clone()));
        if state != WorkerState::Running {
            continue;
        }
        let elapsed = (Utc::now() - last_check).to_std().unwrap_or_default();
        if elapsed < slot.config.health_check.interval() {
            continue;
        }
        let Some(client) = client else {
            continue;
        };

        summary.probed += 1;
        let timeout = slot.config.health_check.timeout();
        let failure = match tokio::time::timeout(timeout, client.list_tools()).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some(format!("timed out after {}s", timeout.as_secs())),
        };

        let Some(message) = failure else {
            slot.with_record(|r| r.health.mark_healthy());
            continue;
        };

        summary.failed += 1;
        if record_probe_failure(&slot, message) {
            summary.became_unhealthy.push(slot.id.clone());

            if supervisor.config().global_settings.auto_recovery() {
                let outcome = supervisor.restart_locked(&slot).await;
                if outcome.success {
                    tracing::info!(worker = %slot.id, "Worker recovered after restart");
                } else {
                    tracing::error!(worker = %slot.id, "Automatic restart failed");
                }
                summary.restarted.push(slot.id.clone());
            }
        }
    }

    summary
}

/// Count a failed probe. Returns true when this failure made the worker unhealthy.
fn record_probe_failure(slot: &WorkerSlot, message: String) -> bool {
    let error = SupervisorError::Probe {
        id: slot.id.clone(),
        message,
    };
    let retry_count = slot.config.health_check.retry_count();

    let (failures, unhealthy) = slot.with_record(|r| {
        r.health.last_check = Utc::now();
        r.health.failure_count += 1;
        r.health.error_message = Some(error.to_string());
        let unhealthy = r.health.failure_count >= retry_count
            && r.health.transition(&slot.id, WorkerState::Unhealthy);
        (r.health.failure_count, unhealthy)
    });

    if unhealthy {
        tracing::error!(worker = %slot.id, failures, "Worker marked unhealthy");
    } else {
        tracing::warn!(worker = %slot.id, failures, retry_count, error = %error, "Health probe failed");
    }
    unhealthy
}
