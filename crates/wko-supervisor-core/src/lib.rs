// ABOUTME: Configuration model, validation and reporting for the wko worker supervisor.
// ABOUTME: Pure data and checks; process control lives in the wko-supervisor crate.

pub mod config;
pub mod error;
pub mod report;
pub mod schema;
pub mod validate;

pub use config::{
    load_document, ConnectionConfig, GlobalSettings, HealthCheckConfig, PortRange,
    RejectedWorker, SupervisorConfig, WorkerConfig, WorkerEntry,
};
pub use error::ConfigError;
pub use report::{render_report, Diagnostic, ExecutableCheck, ValidationReport, WorkerValidation};
pub use schema::{Schema, SchemaViolation};
pub use validate::{find_on_path, validate_server_executable, ConfigValidator};
