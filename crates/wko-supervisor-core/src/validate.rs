// ABOUTME: ConfigValidator: structural and domain rules for worker configuration documents.
// ABOUTME: Never fails; every finding is returned as data in a tiered report.

use crate::config::{worker_section, WorkerConfig, DEFAULT_CATEGORY, DEFAULT_PRIORITY};
use crate::report::{Diagnostic, ExecutableCheck, ValidationReport, WorkerValidation};
use crate::schema::Schema;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

/// Categories a worker may declare.
pub const KNOWN_CATEGORIES: &[&str] = &["workout", "testing", "automation", "data", "ai", "custom"];

/// Command names that are flagged as destructive.
pub const BLOCKED_COMMANDS: &[&str] = &["rm", "del", "format", "sudo", "su"];

const RECOMMENDED_FIELDS: &[&str] = &["name", "description", "category"];
const DRY_RUN_FLAGS: &[&str] = &["--version", "-v", "--help", "-h"];
const DRY_RUN_TIMEOUT: Duration = Duration::from_secs(5);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_RANGE_WIDTH: u64 = 10;

/// Validates configuration documents. Cheap to construct and reuse.
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    schema: Option<Schema>,
    schema_notice: Option<String>,
    probe_ports: bool,
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidator {
    /// A validator without a schema document; only built-in rules apply.
    pub fn new() -> Self {
        Self {
            schema: None,
            schema_notice: Some(
                "No schema document loaded; using built-in validation rules only".to_string(),
            ),
            probe_ports: true,
        }
    }

    pub fn with_schema(schema: Schema) -> Self {
        Self {
            schema: Some(schema),
            schema_notice: None,
            probe_ports: true,
        }
    }

    /// Load the schema at `path`. A missing or unreadable schema downgrades
    /// validation to built-in rules and is reported as a warning.
    pub fn from_schema_path(path: &Path) -> Self {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Schema file not found");
            return Self {
                schema_notice: Some(format!(
                    "Schema file not found: {}; using built-in validation rules only",
                    path.display()
                )),
                ..Self::new()
            };
        }
        match Schema::load(path) {
            Ok(schema) => Self::with_schema(schema),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load schema");
                Self {
                    schema_notice: Some(format!(
                        "Failed to load schema ({}); using built-in validation rules only",
                        e
                    )),
                    ..Self::new()
                }
            }
        }
    }

    /// Skip live probing of explicitly configured ports.
    pub fn without_port_probe(mut self) -> Self {
        self.probe_ports = false;
        self
    }

    pub fn has_schema(&self) -> bool {
        self.schema.is_some()
    }

    /// Validate a complete configuration document.
    pub fn validate_config(&self, document: &Value) -> ValidationReport {
        let mut report = ValidationReport::new();

        if !document.is_object() {
            report.error(Diagnostic::global(
                "Configuration document must be an object",
            ));
            return report.finish();
        }

        match &self.schema {
            Some(schema) => {
                if let Err(violation) = schema.check(document) {
                    tracing::error!(%violation, "Schema validation error");
                    report.error(Diagnostic::global(format!(
                        "Schema validation failed: {}",
                        violation
                    )));
                }
            }
            None => {
                if let Some(notice) = &self.schema_notice {
                    report.warn(Diagnostic::global(notice.clone()));
                }
            }
        }

        let raw_workers = document
            .get(crate::config::WORKERS_KEY)
            .or_else(|| document.get(crate::config::LEGACY_WORKERS_KEY));
        match raw_workers {
            None => report.warn(Diagnostic::global("No workers configured")),
            Some(Value::Object(workers)) if workers.is_empty() => {
                report.warn(Diagnostic::global("No workers configured"))
            }
            Some(Value::Object(_)) => {}
            Some(_) => report.error(Diagnostic::global(
                "workers must be an object mapping worker ids to configurations",
            )),
        }

        if let Some(workers) = worker_section(document) {
            for (id, raw) in workers {
                let validation = self.validate_worker(raw);
                report.absorb(id, validation);
            }
        }

        self.check_global_settings(document, &mut report);
        if let Some(workers) = worker_section(document) {
            self.check_port_conflicts(workers, &mut report);
            check_priorities(workers, &mut report);
        }

        report.finish()
    }

    /// Validate one worker configuration object.
    pub fn validate_worker(&self, raw: &Value) -> WorkerValidation {
        let mut result = WorkerValidation::default();

        let Some(worker) = raw.as_object() else {
            result.error("Worker configuration must be an object");
            return result.finish();
        };

        check_required_fields(worker, &mut result);
        check_command(worker, &mut result);
        check_connection(worker, &mut result);
        check_health_check(worker, &mut result);
        check_environment(worker, &mut result);
        check_categories_capabilities(worker, &mut result);
        check_flags(worker, &mut result);

        result.finish()
    }

    fn check_global_settings(&self, document: &Value, report: &mut ValidationReport) {
        let settings = match document.get("global_settings") {
            None => return,
            Some(Value::Object(settings)) => settings,
            Some(_) => {
                report.error(Diagnostic::global("global_settings must be an object"));
                return;
            }
        };

        if let Some(max) = settings.get("max_concurrent_servers") {
            if !max.as_u64().is_some_and(|n| n >= 1) {
                report.warn(Diagnostic::global(
                    "max_concurrent_servers should be a positive integer",
                ));
            }
        }

        if let Some(timeout) = settings.get("startup_timeout") {
            if !timeout.as_f64().is_some_and(|n| n >= 5.0) {
                report.warn(Diagnostic::global(
                    "startup_timeout should be at least 5 seconds",
                ));
            }
        }

        if let Some(recovery) = settings.get("auto_recovery") {
            if !recovery.is_boolean() {
                report.warn(Diagnostic::global("auto_recovery should be a boolean"));
            }
        }

        let Some(range) = settings.get("port_range") else {
            return;
        };
        let Some(range) = range.as_object() else {
            report.error(Diagnostic::global("port_range must be an object"));
            return;
        };

        let bound = |key: &str, default: u64| match range.get(key) {
            None => Some(default),
            Some(value) => value.as_u64().filter(|p| (1..=65535).contains(p)),
        };
        match (bound("start", 8000), bound("end", 9000)) {
            (Some(start), Some(end)) => {
                if start >= end {
                    report.error(Diagnostic::global(
                        "Port range start must be less than end",
                    ));
                } else if end - start < MIN_RANGE_WIDTH {
                    report.recommend(Diagnostic::global(
                        "Small port range may cause conflicts with multiple workers; \
                         use a range at least 10 ports wide",
                    ));
                }
            }
            _ => report.error(Diagnostic::global(
                "Port range start and end must be integers between 1 and 65535",
            )),
        }
    }

    fn check_port_conflicts(&self, workers: &Map<String, Value>, report: &mut ValidationReport) {
        let mut used: BTreeMap<u64, &str> = BTreeMap::new();

        for (id, raw) in workers {
            let Some(port) = raw
                .get("connection")
                .and_then(|c| c.get("port"))
                .and_then(Value::as_u64)
            else {
                continue;
            };

            if let Some(first) = used.get(&port) {
                report.error(Diagnostic::for_worker(
                    id,
                    format!(
                        "Port conflict: port {} is already used by worker '{}'",
                        port, first
                    ),
                ));
                continue;
            }
            used.insert(port, id);

            if self.probe_ports {
                if let Ok(port) = u16::try_from(port) {
                    if port > 0 && port_in_use(port) {
                        report.warn(Diagnostic::for_worker(
                            id,
                            format!("Port {} appears to be already in use", port),
                        ));
                    }
                }
            }
        }
    }
}

fn check_required_fields(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    match worker.get("command") {
        None => result.error("Missing required field: command"),
        Some(Value::String(cmd)) if !cmd.trim().is_empty() => {}
        Some(_) => result.error("command must be a non-empty string"),
    }

    for field in RECOMMENDED_FIELDS {
        if !worker.contains_key(*field) {
            result.recommend(format!(
                "Consider adding '{}' for better organization",
                field
            ));
        }
    }
}

fn check_command(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    if let Some(args) = worker.get("args") {
        match args.as_array() {
            None => result.error("args must be a list"),
            Some(items) if items.iter().any(|a| !a.is_string()) => {
                result.error("args must contain only strings")
            }
            Some(_) => {}
        }
    }

    let Some(command) = worker.get("command").and_then(Value::as_str) else {
        return;
    };
    if command.trim().is_empty() {
        return;
    }

    if find_on_path(command).is_none() {
        result.warn(format!("Command '{}' not found in PATH", command));
    }

    if is_blocked_command(command) {
        result.warn(format!("Potentially dangerous command detected: {}", command));
    }
}

fn check_connection(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    let connection = match worker.get("connection") {
        None => return,
        Some(Value::Object(connection)) => connection,
        Some(_) => {
            result.error("connection must be an object");
            return;
        }
    };

    if let Some(port) = connection.get("port") {
        match port.as_u64().filter(|p| (1..=65535).contains(p)) {
            None => result.error(format!("Invalid port number: {}", port)),
            Some(p) if p < 1024 => {
                result.warn(format!("Port {} requires elevated privileges", p))
            }
            Some(_) => {}
        }
    }

    if let Some(host) = connection.get("host") {
        if !host.as_str().is_some_and(|h| !h.trim().is_empty()) {
            result.error("Host must be a non-empty string");
        }
    }

    if let Some(delay) = connection.get("startup_delay") {
        if !delay.as_f64().is_some_and(|d| d >= 0.0) {
            result.warn("startup_delay should be a non-negative number of seconds");
        }
    }

    if let Some(url) = connection.get("base_url") {
        if !url.is_string() {
            result.warn("base_url should be a string; the derived endpoint will be used");
        }
    }
}

fn check_health_check(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    let health = match worker.get("health_check") {
        None => return,
        Some(Value::Object(health)) => health,
        Some(_) => {
            result.error("health_check must be an object");
            return;
        }
    };

    let number = |key: &str, default: f64| match health.get(key) {
        None => Some(default),
        Some(value) => value.as_f64(),
    };
    let interval = number("interval", 30.0);
    let timeout = number("timeout", 10.0);
    let retry_count = match health.get("retry_count") {
        None => Some(3),
        Some(value) => value.as_i64(),
    };

    if !interval.is_some_and(|i| i >= 5.0) {
        result.warn("Health check interval should be at least 5 seconds");
    }
    if !timeout.is_some_and(|t| t >= 1.0) {
        result.warn("Health check timeout should be at least 1 second");
    }
    if let (Some(interval), Some(timeout)) = (interval, timeout) {
        if timeout >= interval {
            result.warn("Health check timeout should be less than interval");
        }
    }
    if !retry_count.is_some_and(|r| r >= 1) {
        result.warn("Health check retry_count should be at least 1");
    }
    if health.get("enabled").is_some_and(|e| !e.is_boolean()) {
        result.warn("Health check enabled should be a boolean");
    }
}

fn check_environment(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    let environment = match worker.get("environment") {
        None => return,
        Some(Value::Object(environment)) => environment,
        Some(_) => {
            result.error("environment must be an object");
            return;
        }
    };

    for (name, value) in environment {
        let well_formed = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !well_formed {
            result.warn(format!("Environment variable name '{}' may be invalid", name));
        }
        if !value.is_string() {
            result.warn(format!("Environment variable '{}' should be a string", name));
        }
    }
}

fn check_categories_capabilities(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    let category = worker
        .get("category")
        .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    if !KNOWN_CATEGORIES.contains(&category.as_str()) {
        result.warn(format!(
            "Unknown category '{}'. Valid categories: {}",
            category,
            KNOWN_CATEGORIES.join(", ")
        ));
    }

    for field in ["capabilities", "tags"] {
        match worker.get(field) {
            None => {}
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
            Some(Value::Array(_)) => result.error(format!("{} must contain only strings", field)),
            Some(_) => result.error(format!("{} must be a list", field)),
        }
    }
}

fn check_flags(worker: &Map<String, Value>, result: &mut WorkerValidation) {
    for flag in ["auto_start", "enabled"] {
        if worker.get(flag).is_some_and(|v| !v.is_boolean()) {
            result.warn(format!("{} should be a boolean", flag));
        }
    }
}

fn check_priorities(workers: &Map<String, Value>, report: &mut ValidationReport) {
    let mut by_priority: BTreeMap<i64, Vec<&str>> = BTreeMap::new();

    for (id, raw) in workers {
        let priority = match raw.get("priority") {
            None => Some(DEFAULT_PRIORITY),
            Some(value) => value.as_i64(),
        };
        match priority.filter(|p| (1..=10).contains(p)) {
            Some(p) => by_priority.entry(p).or_default().push(id),
            None => report.warn(Diagnostic::for_worker(
                id,
                format!(
                    "Worker has invalid priority {} (should be 1-10)",
                    raw.get("priority").cloned().unwrap_or(Value::Null)
                ),
            )),
        }
    }

    for (priority, ids) in by_priority {
        if ids.len() > 1 {
            report.recommend(Diagnostic::global(format!(
                "Multiple workers have priority {}: {}. They start in declaration order; \
                 use distinct priorities for an explicit startup order",
                priority,
                ids.join(", ")
            )));
        }
    }
}

fn is_blocked_command(command: &str) -> bool {
    let stem = Path::new(command)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(command)
        .to_ascii_lowercase();
    BLOCKED_COMMANDS.contains(&stem.as_str())
}

fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

/// Resolve a command the way a shell would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_on_path(command: &str) -> Option<PathBuf> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(command))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

/// Dry-run a worker's launch command without starting the real process:
/// the binary must resolve, and is probed with version/help flags.
pub async fn validate_server_executable(config: &WorkerConfig) -> ExecutableCheck {
    let mut result = ExecutableCheck::default();
    let command = config.command.trim();

    if command.is_empty() {
        result.can_start = false;
        result.errors.push("No command specified".to_string());
        return result;
    }

    if find_on_path(command).is_none() {
        result.can_start = false;
        result
            .errors
            .push(format!("Command '{}' not found in PATH", command));
        return result;
    }

    for flag in DRY_RUN_FLAGS {
        let mut probe = tokio::process::Command::new(command);
        probe
            .arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(DRY_RUN_TIMEOUT, probe.status()).await {
            Ok(Ok(status)) if status.success() => {
                result.info.push(format!("Command responds to {}", flag));
                break;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => result.warnings.push(format!("Command test failed: {}", e)),
            Err(_) => {
                result.warnings.push("Command test timed out".to_string());
                break;
            }
        }
    }

    for (name, value) in &config.environment {
        if value.trim().is_empty() {
            result
                .warnings
                .push(format!("Environment variable '{}' is empty", name));
        }
    }

    result
}
