// ABOUTME: Supervisor: starts, stops and restarts workers and exposes their status and capabilities.
// ABOUTME: Launch and handshake failures are recorded in the worker's health state, not raised.

use crate::capability::{build_capabilities, Capability};
use crate::error::SupervisorError;
use crate::health::HealthMonitor;
use crate::ports::PortAllocator;
use crate::process::{OutputLine, WorkerProcess};
use crate::registry::{WorkerRegistry, WorkerSlot};
use crate::rpc::Connector;
use crate::worker::{WorkerState, WorkerStatus};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use wko_supervisor_core::{SupervisorConfig, WorkerConfig};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// How long a worker gets to exit after SIGTERM before it is killed.
    pub stop_grace: Duration,
    /// Pause between stop and start in a restart.
    pub restart_pause: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            restart_pause: Duration::from_secs(1),
        }
    }
}

/// Result of a start, stop or restart.
#[derive(Debug, Clone)]
pub struct LifecycleOutcome {
    pub success: bool,
    /// Snapshot after the operation; `None` only when stopping an unknown worker.
    pub status: Option<WorkerStatus>,
    pub failure: Option<SupervisorError>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    ports: PortAllocator,
    registry: WorkerRegistry,
    connector: Arc<dyn Connector>,
    options: SupervisorOptions,
    /// Held from the capacity check until the new process is recorded.
    launch_gate: Mutex<()>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_options(config, connector, SupervisorOptions::default())
    }

    pub fn with_options(
        config: SupervisorConfig,
        connector: Arc<dyn Connector>,
        options: SupervisorOptions,
    ) -> Self {
        let ports = PortAllocator::new(config.global_settings.port_range, config.pinned_ports());
        Self {
            config,
            ports,
            registry: WorkerRegistry::new(),
            connector,
            options,
            launch_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub(crate) fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Start one worker.
    ///
    /// Errors only for unknown or rejected workers; launch and handshake
    /// failures come back as an unsuccessful outcome.
    pub async fn start(&self, id: &str) -> Result<LifecycleOutcome, SupervisorError> {
        let slot = self.slot_for(id)?;
        let _lifecycle = slot.lock_lifecycle().await;
        Ok(self.start_locked(&slot).await)
    }

    /// Stop one worker. Unknown or never-started workers are a no-op success.
    pub async fn stop(&self, id: &str) -> Result<LifecycleOutcome, SupervisorError> {
        let Some(slot) = self.registry.get(id) else {
            tracing::debug!(worker = %id, "Stop requested for untracked worker");
            return Ok(LifecycleOutcome {
                success: true,
                status: self.get_status(id).ok(),
                failure: None,
            });
        };
        let _lifecycle = slot.lock_lifecycle().await;
        self.stop_locked(&slot).await;
        Ok(outcome(&slot, None))
    }

    pub async fn restart(&self, id: &str) -> Result<LifecycleOutcome, SupervisorError> {
        let slot = self.slot_for(id)?;
        let _lifecycle = slot.lock_lifecycle().await;
        Ok(self.restart_locked(&slot).await)
    }

    /// Start every auto-start worker, one at a time in ascending priority
    /// (declaration order among equal priorities). One failure does not stop
    /// the rest.
    pub async fn start_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();

        for entry in self.config.start_order() {
            if !entry.config.auto_start() {
                tracing::info!(worker = %entry.id, "Skipping worker without auto_start");
                results.insert(entry.id.clone(), false);
                continue;
            }

            let started = match self.start(&entry.id).await {
                Ok(outcome) => outcome.success,
                Err(e) => {
                    tracing::error!(worker = %entry.id, error = %e, "Failed to start worker");
                    false
                }
            };
            results.insert(entry.id.clone(), started);
        }

        for rejected in &self.config.rejected {
            results.insert(rejected.id.clone(), false);
        }

        let running = results.values().filter(|ok| **ok).count();
        tracing::info!(running, total = results.len(), "Started workers");
        results
    }

    /// Stop every tracked worker, regardless of auto_start.
    pub async fn stop_all(&self) {
        for slot in self.registry.all() {
            let _lifecycle = slot.lock_lifecycle().await;
            self.stop_locked(&slot).await;
        }
    }

    /// Stop the health monitor, then every worker.
    pub async fn shutdown(&self, monitor: &mut HealthMonitor) {
        tracing::info!("Shutting down supervisor");
        monitor.stop().await;
        self.stop_all().await;
    }

    /// Last-known status of a configured worker.
    pub fn get_status(&self, id: &str) -> Result<WorkerStatus, SupervisorError> {
        if let Some(slot) = self.registry.get(id) {
            return Ok(slot.status());
        }
        let config = self.known_config(id)?;
        Ok(WorkerSlot::new(id, config.clone()).status())
    }

    /// Status of every accepted worker, in declaration order.
    pub fn statuses(&self) -> Vec<WorkerStatus> {
        self.config
            .workers
            .iter()
            .filter_map(|entry| self.get_status(&entry.id).ok())
            .collect()
    }

    /// Capabilities of every Running worker.
    pub fn get_all_tools(&self) -> Vec<Capability> {
        self.collect_tools(|_| true)
    }

    /// Capabilities of Running workers declaring `category`.
    pub fn get_tools_by_category(&self, category: &str) -> Vec<Capability> {
        self.collect_tools(|slot| slot.config.category() == category)
    }

    /// Recently captured stdout/stderr of a worker's process.
    pub fn recent_output(&self, id: &str) -> Option<Vec<OutputLine>> {
        self.registry.get(id).map(|slot| slot.output().snapshot())
    }

    fn collect_tools(&self, include: impl Fn(&WorkerSlot) -> bool) -> Vec<Capability> {
        self.config
            .workers
            .iter()
            .filter_map(|entry| self.registry.get(&entry.id))
            .filter(|slot| include(slot))
            .flat_map(|slot| {
                slot.with_record(|r| {
                    if r.health.status == WorkerState::Running {
                        r.capabilities.clone()
                    } else {
                        Vec::new()
                    }
                })
            })
            .collect()
    }

    fn known_config(&self, id: &str) -> Result<&WorkerConfig, SupervisorError> {
        if let Some(rejected) = self.config.rejection(id) {
            return Err(SupervisorError::Configuration {
                id: id.to_string(),
                reasons: rejected.reasons.clone(),
            });
        }
        self.config
            .worker(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    fn slot_for(&self, id: &str) -> Result<Arc<WorkerSlot>, SupervisorError> {
        let config = self.known_config(id)?;
        Ok(self.registry.get_or_insert(id, config))
    }

    pub(crate) async fn restart_locked(&self, slot: &WorkerSlot) -> LifecycleOutcome {
        tracing::info!(worker = %slot.id, "Restarting worker");
        self.stop_locked(slot).await;
        tokio::time::sleep(self.options.restart_pause).await;
        self.start_locked(slot).await
    }

    async fn start_locked(&self, slot: &WorkerSlot) -> LifecycleOutcome {
        let id = slot.id.as_str();
        let config = &slot.config;

        if !config.enabled() {
            tracing::info!(worker = %id, "Worker is disabled, not starting");
            return outcome(slot, None);
        }

        match slot.state() {
            WorkerState::Running => {
                tracing::debug!(worker = %id, "Worker already running");
                return outcome(slot, None);
            }
            WorkerState::Stopped => {}
            WorkerState::Starting | WorkerState::Unhealthy | WorkerState::Failed => {
                self.stop_locked(slot).await;
            }
        }

        slot.with_record(|r| {
            r.health.transition(id, WorkerState::Starting);
            r.health.start_time = Some(chrono::Utc::now());
            r.health.error_message = None;
        });
        tracing::info!(worker = %id, "Starting worker");

        let port = match self.launch(slot) {
            Ok(port) => port,
            Err(e) => return self.fail(slot, e),
        };

        tokio::time::sleep(config.connection.startup_delay()).await;

        // The lifecycle lock is held, so the process launched above is still recorded.
        let polled = slot.with_record(|r| r.process.as_mut().map(WorkerProcess::try_exit));
        match polled {
            Some(Ok(None)) => {}
            Some(Ok(Some(status))) => {
                let message = match slot.with_record(|r| r.process.take()) {
                    Some(mut process) => process.exit_message(status).await,
                    None => format!("Process exited with {}", status),
                };
                self.release_port(slot);
                return self.fail(
                    slot,
                    SupervisorError::Launch {
                        id: id.to_string(),
                        message,
                    },
                );
            }
            Some(Err(e)) => {
                if let Some(mut process) = slot.with_record(|r| r.process.take()) {
                    process.terminate(self.options.stop_grace).await;
                }
                self.release_port(slot);
                return self.fail(
                    slot,
                    SupervisorError::Internal(format!("Failed to poll worker process: {}", e)),
                );
            }
            None => {
                self.release_port(slot);
                return self.fail(
                    slot,
                    SupervisorError::Internal("Worker process handle missing".to_string()),
                );
            }
        }

        let endpoint = config.connection.endpoint(port);
        let startup_timeout = self.config.global_settings.startup_timeout();
        let handshake = async {
            let client = self.connector.connect(&endpoint).await?;
            let tools = client.list_tools().await?;
            anyhow::Ok((client, tools))
        };

        match tokio::time::timeout(startup_timeout, handshake).await {
            Ok(Ok((client, tools))) => {
                let capabilities = build_capabilities(id, tools, &client);
                let tool_count = capabilities.len();
                slot.with_record(|r| {
                    r.client = Some(client);
                    r.capabilities = capabilities;
                    r.health.transition(id, WorkerState::Running);
                    r.health.mark_healthy();
                });
                tracing::info!(worker = %id, port, endpoint = %endpoint, tool_count, "Worker running");
                outcome(slot, None)
            }
            Ok(Err(e)) => self.fail(
                slot,
                SupervisorError::Handshake {
                    id: id.to_string(),
                    message: format!("{:#}", e),
                },
            ),
            Err(_) => self.fail(
                slot,
                SupervisorError::Handshake {
                    id: id.to_string(),
                    message: format!("timed out after {}s", startup_timeout.as_secs()),
                },
            ),
        }
    }

    /// Capacity check, port choice and spawn, under the launch gate. The new
    /// process is in the record before the gate is released.
    fn launch(&self, slot: &WorkerSlot) -> Result<u16, SupervisorError> {
        let id = slot.id.as_str();
        let config = &slot.config;
        let _gate = self.launch_gate.lock().unwrap_or_else(PoisonError::into_inner);

        let limit = self.config.global_settings.max_concurrent_servers();
        if self.registry.process_count(id) >= limit {
            return Err(SupervisorError::ResourceExhausted(format!(
                "Maximum concurrent workers ({}) reached",
                limit
            )));
        }

        let (port, leased) = match config.connection.port {
            Some(port) => (port, false),
            None => (self.ports.allocate()?, true),
        };
        slot.with_record(|r| {
            r.port = Some(port);
            r.port_leased = leased;
        });

        match WorkerProcess::spawn(id, config, port, slot.output().clone()) {
            Ok(process) => {
                slot.with_record(|r| r.process = Some(process));
                Ok(port)
            }
            Err(e) => {
                self.release_port(slot);
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, slot: &WorkerSlot) {
        let process = slot.with_record(|r| {
            r.client = None;
            r.capabilities.clear();
            r.process.take()
        });

        if let Some(mut process) = process {
            tracing::info!(worker = %slot.id, pid = ?process.pid(), "Stopping worker");
            process.terminate(self.options.stop_grace).await;
        }

        self.release_port(slot);
        slot.with_record(|r| {
            r.health.transition(&slot.id, WorkerState::Stopped);
            r.health.start_time = None;
        });
    }

    fn release_port(&self, slot: &WorkerSlot) {
        let leased = slot.with_record(|r| {
            if r.port_leased {
                r.port_leased = false;
                r.port.take()
            } else {
                None
            }
        });
        if let Some(port) = leased {
            self.ports.release(port);
        }
    }

    fn fail(&self, slot: &WorkerSlot, error: SupervisorError) -> LifecycleOutcome {
        tracing::error!(worker = %slot.id, error = %error, "Worker failed to start");
        slot.with_record(|r| {
            r.health.transition(&slot.id, WorkerState::Failed);
            r.health.error_message = Some(error.to_string());
        });
        outcome(slot, Some(error))
    }
}

fn outcome(slot: &WorkerSlot, failure: Option<SupervisorError>) -> LifecycleOutcome {
    LifecycleOutcome {
        success: failure.is_none(),
        status: Some(slot.status()),
        failure,
    }
}
