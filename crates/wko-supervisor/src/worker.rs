// ABOUTME: Worker health state machine, the mutable per-worker record, and status snapshots.
// ABOUTME: Transitions outside the state machine are refused and logged.

use crate::capability::Capability;
use crate::process::WorkerProcess;
use crate::rpc::ToolClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use wko_supervisor_core::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Failed,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
        }
    }

    /// States in which a run is in progress and uptime accrues.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Unhealthy)
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (_, Stopped) => true,
            (Stopped, Starting) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Running) | (Running, Unhealthy) => true,
            (Unhealthy, Running) | (Unhealthy, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub status: WorkerState,
    pub last_check: DateTime<Utc>,
    pub failure_count: u32,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            status: WorkerState::Stopped,
            last_check: Utc::now(),
            failure_count: 0,
            error_message: None,
            start_time: None,
        }
    }
}

impl HealthState {
    /// Move to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, worker: &str, next: WorkerState) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(worker, from = %self.status, to = %next, "Refused invalid state transition");
            return false;
        }
        if self.status != next {
            tracing::debug!(worker, from = %self.status, to = %next, "Worker state changed");
        }
        self.status = next;
        true
    }

    /// Record a successful start or probe.
    pub fn mark_healthy(&mut self) {
        self.last_check = Utc::now();
        self.failure_count = 0;
        self.error_message = None;
    }
}

/// Everything mutable about a supervised worker.
#[derive(Default)]
pub struct WorkerRecord {
    pub process: Option<WorkerProcess>,
    pub client: Option<Arc<dyn ToolClient>>,
    pub health: HealthState,
    pub capabilities: Vec<Capability>,
    pub port: Option<u16>,
    /// The port came from the allocator and must be returned to it.
    pub port_leased: bool,
}

/// Point-in-time view of a worker, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub name: String,
    pub status: WorkerState,
    /// Seconds since the current run started; zero when not active.
    pub uptime: f64,
    pub last_check: DateTime<Utc>,
    pub failure_count: u32,
    pub error_message: Option<String>,
    pub tool_count: usize,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub category: String,
    pub capabilities: Vec<String>,
}

impl WorkerStatus {
    pub fn capture(id: &str, config: &WorkerConfig, record: &WorkerRecord) -> Self {
        let health = &record.health;
        let uptime = match health.start_time {
            Some(started) if health.status.is_active() => {
                (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0
            }
            _ => 0.0,
        };

        Self {
            id: id.to_string(),
            name: config.name.clone().unwrap_or_else(|| id.to_string()),
            status: health.status,
            uptime,
            last_check: health.last_check,
            failure_count: health.failure_count,
            error_message: health.error_message.clone(),
            tool_count: record.capabilities.len(),
            port: record.port.or(config.connection.port),
            pid: record.process.as_ref().and_then(WorkerProcess::pid),
            category: config.category().to_string(),
            capabilities: config.capabilities.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkerState::*;

    #[test]
    fn test_state_machine_edges() {
        assert!(Stopped.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Failed));
        for state in [Stopped, Starting, Running, Unhealthy, Failed] {
            assert!(state.can_transition_to(Stopped));
        }

        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Starting));
    }

    #[test]
    fn test_transition_refuses_invalid_moves() {
        let mut health = HealthState::default();
        assert!(!health.transition("w", Running));
        assert_eq!(health.status, Stopped);
        assert!(health.transition("w", Starting));
        assert!(health.transition("w", Failed));
        assert_eq!(health.status, Failed);
    }

    #[test]
    fn test_status_snapshot_defaults() {
        let mut config = WorkerConfig::new("python");
        config.capabilities = vec!["plan".to_string()];
        let record = WorkerRecord::default();
        let status = WorkerStatus::capture("coach", &config, &record);

        assert_eq!(status.name, "coach");
        assert_eq!(status.status, Stopped);
        assert_eq!(status.uptime, 0.0);
        assert_eq!(status.tool_count, 0);
        assert_eq!(status.category, "custom");
        assert_eq!(status.capabilities, vec!["plan".to_string()]);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "stopped");
    }

    #[test]
    fn test_uptime_counts_only_while_active() {
        let config = WorkerConfig::new("python");
        let mut record = WorkerRecord::default();
        record.health.start_time = Some(Utc::now() - chrono::Duration::seconds(5));
        record.health.status = Running;
        assert!(WorkerStatus::capture("w", &config, &record).uptime >= 5.0);

        record.health.status = Failed;
        assert_eq!(WorkerStatus::capture("w", &config, &record).uptime, 0.0);
    }
}
