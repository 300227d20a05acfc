// ABOUTME: Typed configuration for the supervisor: global settings and per-worker configs.
// ABOUTME: Loaded from a JSON or TOML document, validated before any worker is accepted.

use crate::error::ConfigError;
use crate::report::ValidationReport;
use crate::validate::ConfigValidator;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT_RANGE_START: u16 = 8000;
pub const DEFAULT_PORT_RANGE_END: u16 = 9000;
pub const DEFAULT_MAX_CONCURRENT: usize = 10;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_ENDPOINT_PATH: &str = "/mcp";
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 3;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_CATEGORY: &str = "custom";

/// Key holding the worker map. `mcp_servers` is the legacy spelling.
pub const WORKERS_KEY: &str = "workers";
pub const LEGACY_WORKERS_KEY: &str = "mcp_servers";

/// Parse a value, substituting `None` (and so the field default) when it has
/// the wrong type. Used for advisory settings that must never block startup.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Seconds from an advisory duration setting, falling back to `default_secs`
/// when the value is missing, wrong-typed, negative, or zero where `zero_ok`
/// is false. Fractional seconds are kept.
fn seconds_or(value: Option<f64>, zero_ok: bool, default_secs: u64) -> Duration {
    value
        .filter(|secs| *secs > 0.0 || (zero_ok && *secs == 0.0))
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(Duration::from_secs(default_secs))
}

/// Environment overrides; scalar values are stringified, other values dropped.
fn env_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| match value {
            Value::String(s) => Some((key, s)),
            Value::Number(n) => Some((key, n.to_string())),
            Value::Bool(b) => Some((key, b.to_string())),
            _ => None,
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub port_range: PortRange,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub max_concurrent_servers: Option<usize>,
    /// Seconds allowed for the readiness handshake.
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub startup_timeout: Option<f64>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub auto_recovery: Option<bool>,
}

impl GlobalSettings {
    pub fn max_concurrent_servers(&self) -> usize {
        self.max_concurrent_servers
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    /// Deadline for the readiness handshake. Zero would fail every start, so it means the default.
    pub fn startup_timeout(&self) -> Duration {
        seconds_or(self.startup_timeout, false, DEFAULT_STARTUP_TIMEOUT_SECS)
    }

    pub fn auto_recovery(&self) -> bool {
        self.auto_recovery.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    /// Pinned port. When absent one is allocated from the global range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub startup_delay: Option<f64>,
    /// Full endpoint URL, overriding host/port/path.
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            startup_delay: None,
            base_url: None,
            path: None,
        }
    }
}

impl ConnectionConfig {
    pub fn startup_delay(&self) -> Duration {
        seconds_or(self.startup_delay, true, DEFAULT_STARTUP_DELAY_SECS)
    }

    /// Endpoint URL for a worker listening on `port`.
    pub fn endpoint(&self, port: u16) -> String {
        if let Some(url) = &self.base_url {
            return url.clone();
        }
        let path = self.path.as_deref().unwrap_or(DEFAULT_ENDPOINT_PATH);
        let path = path.trim_start_matches('/');
        format!("http://{}:{}/{}", self.host, port, path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl HealthCheckConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn interval(&self) -> Duration {
        seconds_or(self.interval, true, DEFAULT_HEALTH_INTERVAL_SECS)
    }

    pub fn timeout(&self) -> Duration {
        seconds_or(self.timeout, false, DEFAULT_HEALTH_TIMEOUT_SECS)
    }

    /// Consecutive failures before a worker turns unhealthy. Zero means the default.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_RETRY_COUNT)
    }
}

/// Launch and supervision settings for one worker. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, deserialize_with = "env_map")]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl WorkerConfig {
    /// A minimal config launching `command`, everything else defaulted.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            name: None,
            description: None,
            command: command.into(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            connection: ConnectionConfig::default(),
            health_check: HealthCheckConfig::default(),
            priority: None,
            auto_start: None,
            enabled: None,
            category: None,
            capabilities: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn priority(&self) -> i64 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start.unwrap_or(true)
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn category(&self) -> &str {
        self.category.as_deref().unwrap_or(DEFAULT_CATEGORY)
    }
}

/// A worker accepted for supervision, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEntry {
    pub id: String,
    pub config: WorkerConfig,
}

/// A worker excluded because of fatal configuration problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedWorker {
    pub id: String,
    pub reasons: Vec<String>,
}

/// The validated configuration the supervisor runs from.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub global_settings: GlobalSettings,
    pub workers: Vec<WorkerEntry>,
    pub rejected: Vec<RejectedWorker>,
    pub report: ValidationReport,
}

impl SupervisorConfig {
    /// Load, validate and type a configuration file.
    pub fn load(path: &Path, validator: &ConfigValidator) -> Result<Self, ConfigError> {
        let document = load_document(path)?;
        Self::from_document(&document, validator)
    }

    /// Validate and type a configuration document.
    ///
    /// Global fatal problems fail the whole load. A worker with fatal
    /// problems of its own is kept out of `workers` and listed in `rejected`.
    pub fn from_document(
        document: &Value,
        validator: &ConfigValidator,
    ) -> Result<Self, ConfigError> {
        let report = validator.validate_config(document);

        let global_errors: Vec<String> = report.global_errors().map(|d| d.to_string()).collect();
        if !global_errors.is_empty() {
            return Err(ConfigError::Invalid(global_errors));
        }

        for warning in &report.warnings {
            tracing::warn!(%warning, "Configuration warning");
        }
        for recommendation in &report.recommendations {
            tracing::info!(%recommendation, "Configuration recommendation");
        }

        let global_settings: GlobalSettings = match document.get("global_settings") {
            Some(settings) => serde_json::from_value(settings.clone())
                .map_err(|e| ConfigError::Invalid(vec![format!("global_settings: {}", e)]))?,
            None => GlobalSettings::default(),
        };

        let mut workers = Vec::new();
        let mut rejected = Vec::new();

        for (id, raw) in worker_section(document).into_iter().flatten() {
            let reasons: Vec<String> = report.errors_for(id).map(|d| d.message.clone()).collect();
            if !reasons.is_empty() {
                tracing::error!(worker = %id, reasons = ?reasons, "Worker rejected");
                rejected.push(RejectedWorker {
                    id: id.clone(),
                    reasons,
                });
                continue;
            }

            match serde_json::from_value::<WorkerConfig>(raw.clone()) {
                Ok(config) => workers.push(WorkerEntry {
                    id: id.clone(),
                    config,
                }),
                Err(e) => {
                    tracing::error!(worker = %id, error = %e, "Worker rejected");
                    rejected.push(RejectedWorker {
                        id: id.clone(),
                        reasons: vec![e.to_string()],
                    });
                }
            }
        }

        tracing::info!(
            workers = workers.len(),
            rejected = rejected.len(),
            "Loaded configuration"
        );

        Ok(Self {
            global_settings,
            workers,
            rejected,
            report,
        })
    }

    /// Build a config directly from typed parts, bypassing document validation.
    pub fn from_parts(global_settings: GlobalSettings, workers: Vec<WorkerEntry>) -> Self {
        Self {
            global_settings,
            workers,
            rejected: Vec::new(),
            report: ValidationReport::empty(),
        }
    }

    pub fn worker(&self, id: &str) -> Option<&WorkerConfig> {
        self.workers
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| &entry.config)
    }

    pub fn rejection(&self, id: &str) -> Option<&RejectedWorker> {
        self.rejected.iter().find(|r| r.id == id)
    }

    /// Ports pinned by accepted workers; kept out of the allocation pool.
    pub fn pinned_ports(&self) -> Vec<u16> {
        self.workers
            .iter()
            .filter_map(|entry| entry.config.connection.port)
            .collect()
    }

    /// Accepted workers in start order: ascending priority, ties in
    /// declaration order.
    pub fn start_order(&self) -> Vec<&WorkerEntry> {
        let mut ordered: Vec<&WorkerEntry> = self.workers.iter().collect();
        // sort_by_key is stable, which keeps declaration order among equals
        ordered.sort_by_key(|entry| entry.config.priority());
        ordered
    }

    /// Get the default config file path (~/.config/wko/supervisor.json)
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("wko")
            .join("supervisor.json")
    }
}

/// The worker map of a document, under either accepted key.
pub fn worker_section(document: &Value) -> Option<&serde_json::Map<String, Value>> {
    document
        .get(WORKERS_KEY)
        .or_else(|| document.get(LEGACY_WORKERS_KEY))
        .and_then(Value::as_object)
}

/// Read a configuration document from a `.json` or `.toml` file, keeping key order.
pub fn load_document(path: &Path) -> Result<Value, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content).map_err(|e| parse_error(e.to_string())),
        Some("toml") => toml::from_str(&content).map_err(|e| parse_error(e.to_string())),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn validator() -> ConfigValidator {
        ConfigValidator::new().without_port_probe()
    }

    #[test]
    fn test_worker_defaults() {
        let config: WorkerConfig = serde_json::from_value(json!({"command": "python"})).unwrap();
        assert_eq!(config.priority(), DEFAULT_PRIORITY);
        assert!(config.auto_start());
        assert!(config.enabled());
        assert_eq!(config.category(), "custom");
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.startup_delay(), Duration::from_secs(3));
        assert_eq!(config.health_check.interval(), Duration::from_secs(30));
        assert_eq!(config.health_check.timeout(), Duration::from_secs(10));
        assert_eq!(config.health_check.retry_count(), 3);
    }

    #[test]
    fn test_wrong_typed_advisory_fields_fall_back_to_defaults() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "command": "python",
            "priority": "high",
            "connection": {"startup_delay": -2},
            "health_check": {"interval": "often", "retry_count": 0},
            "environment": {"DEBUG": true, "LEVEL": 3, "NESTED": {"a": 1}}
        }))
        .unwrap();
        assert_eq!(config.priority(), DEFAULT_PRIORITY);
        assert_eq!(config.connection.startup_delay(), Duration::from_secs(3));
        assert_eq!(config.health_check.interval(), Duration::from_secs(30));
        assert_eq!(config.health_check.retry_count(), DEFAULT_RETRY_COUNT);
        assert_eq!(config.environment.get("DEBUG").map(String::as_str), Some("true"));
        assert_eq!(config.environment.get("LEVEL").map(String::as_str), Some("3"));
        assert!(!config.environment.contains_key("NESTED"));
    }

    #[test]
    fn test_unusable_durations_fall_back_and_fractions_are_kept() {
        let config: WorkerConfig = serde_json::from_value(json!({
            "command": "python",
            "connection": {"startup_delay": 1.5},
            "health_check": {"interval": 0, "timeout": 0}
        }))
        .unwrap();
        assert_eq!(config.connection.startup_delay(), Duration::from_millis(1500));
        // zero interval is usable: probe on every monitor tick
        assert_eq!(config.health_check.interval(), Duration::ZERO);
        assert_eq!(config.health_check.timeout(), Duration::from_secs(10));

        let settings: GlobalSettings = serde_json::from_value(json!({"startup_timeout": 0})).unwrap();
        assert_eq!(settings.startup_timeout(), Duration::from_secs(30));
        let settings: GlobalSettings = serde_json::from_value(json!({"startup_timeout": -4})).unwrap();
        assert_eq!(settings.startup_timeout(), Duration::from_secs(30));
        let settings: GlobalSettings = serde_json::from_value(json!({"startup_timeout": 2})).unwrap();
        assert_eq!(settings.startup_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_endpoint_derivation() {
        let mut connection = ConnectionConfig::default();
        assert_eq!(connection.endpoint(9001), "http://localhost:9001/mcp");

        connection.path = Some("rpc".to_string());
        connection.host = "127.0.0.1".to_string();
        assert_eq!(connection.endpoint(9001), "http://127.0.0.1:9001/rpc");

        connection.base_url = Some("http://worker.local:7000/mcp".to_string());
        assert_eq!(connection.endpoint(9001), "http://worker.local:7000/mcp");
    }

    #[test]
    fn test_from_document_rejects_only_the_bad_worker() {
        let doc = json!({
            "global_settings": {"port_range": {"start": 9000, "end": 9010}},
            "workers": {
                "alpha": {"command": "sh", "priority": 1},
                "beta": {"command": "sh", "connection": {"port": 70000}}
            }
        });
        let config = SupervisorConfig::from_document(&doc, &validator()).unwrap();
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].id, "alpha");
        let rejection = config.rejection("beta").unwrap();
        assert!(rejection.reasons.iter().any(|r| r.contains("port")));
        assert!(config.worker("beta").is_none());
    }

    #[test]
    fn test_from_document_fails_on_unusable_port_range() {
        let doc = json!({
            "global_settings": {"port_range": {"start": 9010, "end": 9000}},
            "workers": {"alpha": {"command": "sh"}}
        });
        let err = SupervisorConfig::from_document(&doc, &validator()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_port_collision_rejects_later_worker() {
        let doc = json!({
            "workers": {
                "first": {"command": "sh", "connection": {"port": 8100}},
                "second": {"command": "sh", "connection": {"port": 8100}}
            }
        });
        let config = SupervisorConfig::from_document(&doc, &validator()).unwrap();
        assert!(config.worker("first").is_some());
        assert!(config.rejection("second").is_some());
        assert_eq!(config.pinned_ports(), vec![8100]);
    }

    #[test]
    fn test_start_order_is_priority_then_declaration() {
        let doc = json!({
            "workers": {
                "c": {"command": "sh", "priority": 3},
                "b2": {"command": "sh", "priority": 2},
                "a": {"command": "sh", "priority": 1},
                "b1": {"command": "sh", "priority": 2}
            }
        });
        let config = SupervisorConfig::from_document(&doc, &validator()).unwrap();
        let order: Vec<&str> = config.start_order().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b2", "b1", "c"]);
    }

    #[test]
    fn test_legacy_worker_key_is_accepted() {
        let doc = json!({"mcp_servers": {"legacy": {"command": "sh"}}});
        let config = SupervisorConfig::from_document(&doc, &validator()).unwrap();
        assert_eq!(config.workers[0].id, "legacy");
    }

    #[test]
    fn test_load_toml_keeps_declaration_order() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [global_settings]
            auto_recovery = false

            [workers.zeta]
            command = "sh"

            [workers.alpha]
            command = "sh"
        "#
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path(), &validator()).unwrap();
        let ids: Vec<&str> = config.workers.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert!(!config.global_settings.auto_recovery());
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = load_document(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_default_path_ends_with_supervisor_json() {
        let path = SupervisorConfig::default_path();
        assert!(path.ends_with("wko/supervisor.json"));
    }
}
