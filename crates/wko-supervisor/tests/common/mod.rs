// ABOUTME: Shared helpers for supervisor integration tests.
// ABOUTME: Scripted in-memory workers behind the Connector seam, plus config builders.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wko_supervisor::{Connector, Supervisor, SupervisorOptions, ToolClient, ToolInfo, ToolOutput};
use wko_supervisor_core::{ConfigValidator, SupervisorConfig};

/// A scripted worker. Endpoints are matched by their last path segment.
#[derive(Default)]
pub struct FakeWorker {
    pub tools: Vec<ToolInfo>,
    /// Fail this many upcoming `tools/list` calls.
    pub fail_next: AtomicUsize,
    /// Never answer `tools/list`.
    pub hang: AtomicBool,
    /// Panic inside the next `tools/list`.
    pub panic_next: AtomicBool,
    pub connect_delay: Mutex<Duration>,
    pub list_calls: AtomicUsize,
    pub connects: AtomicUsize,
}

impl FakeWorker {
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolClient for FakeWorker {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("scripted worker panic");
        }
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("probe refused");
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        Ok(ToolOutput {
            text: format!("{} {}", name, arguments),
            is_error: false,
        })
    }
}

#[derive(Default)]
pub struct FakeConnector {
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
    log: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a worker reachable at any endpoint ending in `/<name>`.
    pub fn add(&self, name: &str, tools: &[&str]) -> Arc<FakeWorker> {
        let worker = Arc::new(FakeWorker {
            tools: tools
                .iter()
                .map(|tool| ToolInfo {
                    name: tool.to_string(),
                    description: Some(format!("{} tool", tool)),
                    input_schema: serde_json::json!({"type": "object"}),
                })
                .collect(),
            ..FakeWorker::default()
        });
        self.workers
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&worker));
        worker
    }

    /// Worker names in the order they were connected to.
    pub fn connect_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ToolClient>> {
        let name = endpoint.rsplit('/').next().unwrap_or_default().to_string();
        self.log.lock().unwrap().push(name.clone());

        let worker = self.workers.lock().unwrap().get(&name).cloned();
        let Some(worker) = worker else {
            anyhow::bail!("connection refused: {}", endpoint);
        };

        let delay = *worker.connect_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        worker.connects.fetch_add(1, Ordering::SeqCst);
        Ok(worker as Arc<dyn ToolClient>)
    }
}

/// A worker entry running `sleep 30`, reached at `/<id>` with no startup delay.
pub fn sleeper(id: &str) -> Value {
    serde_json::json!({
        "command": "sleep",
        "args": ["30"],
        "connection": {"startup_delay": 0, "path": format!("/{}", id)},
        "health_check": {"interval": 0, "timeout": 1, "retry_count": 3}
    })
}

pub fn config(document: Value) -> SupervisorConfig {
    SupervisorConfig::from_document(&document, &ConfigValidator::new().without_port_probe())
        .expect("config loads")
}

pub fn supervisor(document: Value, connector: Arc<FakeConnector>) -> Arc<Supervisor> {
    wko_log::init_test();
    Arc::new(Supervisor::with_options(
        config(document),
        connector,
        SupervisorOptions {
            stop_grace: Duration::from_secs(5),
            restart_pause: Duration::from_millis(10),
        },
    ))
}

/// Whether a process with this pid exists.
pub fn process_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}
