// ABOUTME: Integration tests for the health monitor's failure counting and auto-recovery.
// ABOUTME: Passes are driven by hand through run_once; the loop itself is tested for start/stop.

mod common;

use common::{sleeper, supervisor, FakeConnector};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use wko_supervisor::{HealthMonitor, MonitorOptions, WorkerState};

fn document(id: &str, retry_count: u32, auto_recovery: bool, start: u16) -> serde_json::Value {
    let mut worker = sleeper(id);
    worker["health_check"]["retry_count"] = json!(retry_count);
    json!({
        "global_settings": {
            "auto_recovery": auto_recovery,
            "port_range": {"start": start, "end": start + 10}
        },
        "workers": {id: worker}
    })
}

#[tokio::test]
async fn test_unhealthy_after_retry_count_without_recovery() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 2, false, 10000), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);

    let monitor = HealthMonitor::new(Arc::clone(&sup));
    worker.fail_next(10);

    let pass = monitor.run_once().await;
    assert_eq!((pass.probed, pass.failed), (1, 1));
    let status = sup.get_status("w").unwrap();
    assert_eq!(status.status, WorkerState::Running);
    assert_eq!(status.failure_count, 1);
    assert_eq!(
        status.error_message.as_deref(),
        Some("Health probe failed: probe refused")
    );

    let pass = monitor.run_once().await;
    assert_eq!(pass.became_unhealthy, vec!["w".to_string()]);
    assert!(pass.restarted.is_empty());
    assert_eq!(sup.get_status("w").unwrap().status, WorkerState::Unhealthy);

    // Unhealthy workers are not probed again, so the transition fires once
    let pass = monitor.run_once().await;
    assert_eq!(pass.probed, 0);
    assert!(pass.became_unhealthy.is_empty());
    assert_eq!(sup.get_status("w").unwrap().failure_count, 2);

    // An explicit restart brings it back with a clean count
    worker.fail_next(0);
    let outcome = sup.restart("w").await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.status.unwrap().failure_count, 0);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_auto_recovery_restarts_exactly_once() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 2, true, 10100), Arc::clone(&connector));
    let first_pid = sup.start("w").await.unwrap().status.unwrap().pid;

    let monitor = HealthMonitor::new(Arc::clone(&sup));
    worker.fail_next(2);

    let pass = monitor.run_once().await;
    assert!(pass.restarted.is_empty());

    let pass = monitor.run_once().await;
    assert_eq!(pass.became_unhealthy, vec!["w".to_string()]);
    assert_eq!(pass.restarted, vec!["w".to_string()]);
    assert_eq!(worker.connects(), 2);

    let status = sup.get_status("w").unwrap();
    assert_eq!(status.status, WorkerState::Running);
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.error_message, None);
    assert_ne!(status.pid, first_pid);

    // Healthy again: later passes probe without restarting
    let pass = monitor.run_once().await;
    assert_eq!((pass.probed, pass.failed), (1, 0));
    assert!(pass.restarted.is_empty());
    assert_eq!(worker.connects(), 2);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_failed_auto_recovery_ends_failed() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 1, true, 10200), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);

    // The probe and the restart handshake both fail
    worker.fail_next(2);
    let pass = HealthMonitor::new(Arc::clone(&sup)).run_once().await;
    assert_eq!(pass.restarted, vec!["w".to_string()]);

    let status = sup.get_status("w").unwrap();
    assert_eq!(status.status, WorkerState::Failed);
    assert!(status
        .error_message
        .unwrap()
        .starts_with("Handshake failed"));

    sup.stop_all().await;
}

#[tokio::test]
async fn test_success_resets_failure_count() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 3, true, 10300), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);

    let monitor = HealthMonitor::new(Arc::clone(&sup));
    worker.fail_next(1);
    monitor.run_once().await;
    assert_eq!(sup.get_status("w").unwrap().failure_count, 1);

    monitor.run_once().await;
    let status = sup.get_status("w").unwrap();
    assert_eq!(status.failure_count, 0);
    assert_eq!(status.error_message, None);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_probes_respect_interval_and_enabled() {
    let connector = FakeConnector::new();
    let slow = connector.add("slow", &["x"]);
    let off = connector.add("off", &["y"]);

    let mut slow_cfg = sleeper("slow");
    slow_cfg["health_check"]["interval"] = json!(3600);
    let mut off_cfg = sleeper("off");
    off_cfg["health_check"]["enabled"] = json!(false);

    let sup = supervisor(
        json!({
            "global_settings": {"port_range": {"start": 10400, "end": 10410}},
            "workers": {"slow": slow_cfg, "off": off_cfg}
        }),
        Arc::clone(&connector),
    );
    sup.start_all().await;
    let (slow_calls, off_calls) = (slow.list_calls(), off.list_calls());

    let pass = HealthMonitor::new(Arc::clone(&sup)).run_once().await;
    assert_eq!(pass.probed, 0);
    assert_eq!(slow.list_calls(), slow_calls);
    assert_eq!(off.list_calls(), off_calls);

    sup.stop_all().await;
}

#[tokio::test]
async fn test_monitor_loop_start_stop() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 3, true, 10500), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);
    let calls_after_start = worker.list_calls();

    let mut monitor = HealthMonitor::spawn(
        Arc::clone(&sup),
        MonitorOptions {
            tick: Duration::from_millis(20),
            error_backoff: Duration::from_millis(100),
        },
    );
    assert!(monitor.is_running());
    // Starting again is a no-op
    monitor.start();
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(worker.list_calls() > calls_after_start);

    sup.shutdown(&mut monitor).await;
    assert!(!monitor.is_running());
    assert_eq!(sup.get_status("w").unwrap().status, WorkerState::Stopped);
}

#[tokio::test]
async fn test_pass_skips_worker_busy_in_another_probe() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 3, false, 10600), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);

    // The first pass holds the worker's lifecycle lock while its probe hangs
    worker.hang.store(true, Ordering::SeqCst);
    let first = HealthMonitor::new(Arc::clone(&sup));
    let first = tokio::spawn(async move { first.run_once().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = HealthMonitor::new(Arc::clone(&sup)).run_once().await;
    assert_eq!(second.probed, 0);
    assert_eq!(sup.get_status("w").unwrap().status, WorkerState::Running);

    let first = first.await.unwrap();
    assert_eq!((first.probed, first.failed), (1, 1));
    assert_eq!(
        sup.get_status("w").unwrap().error_message.as_deref(),
        Some("Health probe failed: timed out after 1s")
    );

    sup.stop_all().await;
}

#[tokio::test]
async fn test_panicking_pass_backs_off_and_loop_survives() {
    let connector = FakeConnector::new();
    let worker = connector.add("w", &["x"]);
    let sup = supervisor(document("w", 3, true, 10700), Arc::clone(&connector));
    assert!(sup.start("w").await.unwrap().success);
    let calls_after_start = worker.list_calls();

    worker.panic_next.store(true, Ordering::SeqCst);
    let mut monitor = HealthMonitor::spawn(
        Arc::clone(&sup),
        MonitorOptions {
            tick: Duration::from_millis(20),
            error_backoff: Duration::from_secs(30),
        },
    );

    // One probe panics, then the loop sleeps out the backoff instead of ticking
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.list_calls(), calls_after_start + 1);
    assert!(monitor.is_running());
    assert_eq!(sup.get_status("w").unwrap().status, WorkerState::Running);

    // Cancellation interrupts the backoff sleep
    let stopped = tokio::time::timeout(Duration::from_secs(5), monitor.stop()).await;
    assert!(stopped.is_ok());
    assert!(!monitor.is_running());

    sup.stop_all().await;
}
