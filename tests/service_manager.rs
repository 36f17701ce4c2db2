//! Service manager lifecycle contract: dependency-ordered startup,
//! readiness timeouts, and reverse-order shutdown.

use parlance::services::{ServiceDefinition, ServiceManager, spawn_service};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Shared start/stop event log.
type EventLog = Arc<Mutex<Vec<String>>>;

fn log_of(log: &EventLog) -> Vec<String> {
    log.lock().expect("log lock").clone()
}

/// A well-behaved service: signals ready immediately, exits on cancel.
fn good_service(name: &'static str, log: EventLog) -> ServiceDefinition {
    ServiceDefinition::new(
        name,
        Box::new(move || {
            Ok(spawn_service(move |ready, cancel| async move {
                log.lock().expect("log lock").push(format!("start:{name}"));
                ready.set();
                cancel.cancelled().await;
                log.lock().expect("log lock").push(format!("stop:{name}"));
            }))
        }),
    )
}

/// A service that never becomes ready.
fn stuck_service(name: &'static str) -> ServiceDefinition {
    ServiceDefinition::new(
        name,
        Box::new(move || {
            Ok(spawn_service(move |_ready, cancel| async move {
                cancel.cancelled().await;
            }))
        }),
    )
    .with_startup_timeout(Duration::from_millis(300))
}

#[tokio::test]
async fn services_start_in_order_and_stop_in_reverse() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));

    manager
        .start_services(vec![
            good_service("asr", Arc::clone(&log)),
            good_service("llm", Arc::clone(&log)).with_dependencies(&["asr"]),
            good_service("tts", Arc::clone(&log)).with_dependencies(&["llm"]),
        ])
        .await
        .expect("startup");

    assert!(manager.is_service_ready("asr"));
    assert!(manager.is_service_ready("tts"));

    manager.stop_all().await;
    assert_eq!(
        log_of(&log),
        vec!["start:asr", "start:llm", "start:tts", "stop:tts", "stop:llm", "stop:asr"],
    );
    assert_eq!(manager.status().total_services, 0);
}

#[tokio::test]
async fn missing_dependency_fails_fast() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));

    let result = manager
        .start_service(good_service("llm", Arc::clone(&log)).with_dependencies(&["asr"]))
        .await;
    assert!(result.is_err());
    assert!(log_of(&log).is_empty(), "factory must not run");
    assert!(manager.status().startup_errors.contains_key("llm"));
}

#[tokio::test]
async fn readiness_timeout_fails_required_service() {
    let mut manager = ServiceManager::new(Duration::from_secs(1));
    let start = Instant::now();
    let result = manager.start_service(stuck_service("llm")).await;
    assert!(result.is_err());
    // The full default 60s timeout must not apply; the definition's does.
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn worker_death_before_ready_fails_early() {
    let mut manager = ServiceManager::new(Duration::from_secs(1));
    let definition = ServiceDefinition::new(
        "asr",
        Box::new(|| Ok(spawn_service(|_ready, _cancel| async move {})))
    )
    .with_startup_timeout(Duration::from_secs(30));

    let start = Instant::now();
    let result = manager.start_service(definition).await;
    assert!(result.is_err());
    assert!(start.elapsed() < Duration::from_secs(5), "should not wait out the timeout");
}

#[tokio::test]
async fn optional_service_failure_is_recorded_not_propagated() {
    let mut manager = ServiceManager::new(Duration::from_secs(1));
    let started = manager
        .start_service(stuck_service("wakeword").optional())
        .await
        .expect("optional failure must not error");
    assert!(!started);
    assert!(manager.status().startup_errors.contains_key("wakeword"));
}

#[tokio::test]
async fn required_failure_tears_down_started_services() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));

    let result = manager
        .start_services(vec![
            good_service("asr", Arc::clone(&log)),
            stuck_service("llm"),
        ])
        .await;
    assert!(result.is_err());
    // ASR was started, then torn down by the failed batch.
    assert_eq!(log_of(&log), vec!["start:asr", "stop:asr"]);
    assert_eq!(manager.status().total_services, 0);
}

#[tokio::test]
async fn health_check_failure_aborts_service() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));

    let result = manager
        .start_service(
            good_service("tts", Arc::clone(&log)).with_health_check(Box::new(|_| false)),
        )
        .await;
    assert!(result.is_err());
    assert!(!manager.is_service_running("tts"));
}

#[tokio::test]
async fn hung_service_is_aborted_after_shutdown_wait() {
    let mut manager = ServiceManager::new(Duration::from_millis(200));
    manager
        .start_service(ServiceDefinition::new(
            "playback",
            Box::new(|| {
                Ok(spawn_service(|ready, _cancel| async move {
                    ready.set();
                    // Ignores cancellation entirely.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }))
            }),
        ))
        .await
        .expect("startup");

    let start = Instant::now();
    manager.stop_all().await;
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn shutdown_hooks_run_before_services_stop() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));
    manager
        .start_service(good_service("asr", Arc::clone(&log)))
        .await
        .expect("startup");

    let hook_log = Arc::clone(&log);
    manager.add_shutdown_hook(Box::new(move || {
        hook_log.lock().expect("log lock").push("hook".to_owned());
    }));

    manager.stop_all().await;
    assert_eq!(log_of(&log), vec!["start:asr", "hook", "stop:asr"]);
}

#[tokio::test]
async fn status_reports_startup_times() {
    let log: EventLog = Arc::default();
    let mut manager = ServiceManager::new(Duration::from_secs(1));
    manager
        .start_service(good_service("asr", Arc::clone(&log)))
        .await
        .expect("startup");

    let status = manager.status();
    assert_eq!(status.total_services, 1);
    assert!(status.services["asr"].running);
    assert!(status.services["asr"].ready);
    assert!(status.startup_times_secs.contains_key("asr"));
    manager.stop_all().await;
}
