//! Execution lifecycle tests against a deterministic probe.

use std::sync::atomic::Ordering;
use std::time::Duration;

use stressforge::core::events::EngineEvent;
use stressforge::core::models::FieldValue;
use stressforge::error::EngineError;
use stressforge::{EngineConfig, ExecutionStatus, TestConfiguration, TestParams};

use super::support::{
    engine_with_probe, engine_with_recorder, wait_terminal, ExecBehavior, FakeProbe,
};

fn healthy_probe() -> FakeProbe {
    FakeProbe::steady(50.0, 40.0, 20.0, 30.0)
}

fn cpu_config(duration: Duration) -> TestConfiguration {
    TestConfiguration::new(
        "cpu happy path",
        "cpu-stress",
        serde_json::json!({
            "workers": 2,
            "algorithm": "prime",
            "intensity": 50,
            "ramp_up": false
        }),
        duration,
    )
}

fn params(duration: Duration) -> TestParams {
    TestParams {
        duration,
        intensity: 50,
        concurrency: 1,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cpu_happy_path_completes_with_metrics() {
    let engine = engine_with_probe(healthy_probe(), EngineConfig::default());
    let duration = Duration::from_secs(2);

    let mut events = engine.subscribe();
    let id = engine
        .orchestrator()
        .start_test(cpu_config(duration), params(duration))
        .unwrap();

    // Pending -> Running promptly.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let running = engine.orchestrator().get_status(id).unwrap();
    assert!(matches!(
        running.status,
        ExecutionStatus::Running | ExecutionStatus::Completed
    ));

    let record = wait_terminal(&engine, id, Duration::from_millis(2500)).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.error_message.is_none());
    let end = record.end_time.expect("terminal execution has end time");
    assert!(end >= record.start_time);

    // Metrics buffer is non-empty, tagged with the execution id, and
    // timestamped within the run (small slack for in-flight samples).
    let points = engine.orchestrator().get_metrics(id).unwrap();
    assert!(!points.is_empty());
    let slack = chrono::Duration::milliseconds(200);
    for point in &points {
        assert_eq!(point.execution_id, id);
        assert!(point.timestamp >= record.start_time - slack);
        assert!(point.timestamp <= end + slack);
    }
    let ops: Vec<i64> = points
        .iter()
        .filter(|p| p.source == "cpu-stress")
        .filter_map(|p| match p.fields.get("ops_per_sec") {
            Some(FieldValue::Int(n)) => Some(*n),
            _ => None,
        })
        .collect();
    assert!(
        ops.iter().any(|&n| n > 0),
        "expected positive ops_per_sec, got {ops:?}"
    );

    // Started and finished events were published in order.
    let mut saw_started = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::ExecutionStarted { execution_id, .. } if execution_id == id => {
                assert!(!saw_finished);
                saw_started = true;
            }
            EngineEvent::ExecutionFinished {
                execution_id,
                status,
                ..
            } if execution_id == id => {
                assert_eq!(status, ExecutionStatus::Completed);
                saw_finished = true;
            }
            _ => {}
        }
    }
    assert!(saw_started && saw_finished);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_mid_run_transitions_to_stopped() {
    let engine = engine_with_probe(healthy_probe(), EngineConfig::default());
    let duration = Duration::from_secs(60);

    let id = engine
        .orchestrator()
        .start_test(cpu_config(duration), params(duration))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    engine.orchestrator().stop_test(id).unwrap();

    let record = wait_terminal(&engine, id, Duration::from_millis(1500)).await;
    assert_eq!(record.status, ExecutionStatus::Stopped);
    assert!(record.error_message.is_some());
    assert!(record.duration < Duration::from_secs(2));

    // Repeated stop on a terminal execution reports NotRunning.
    assert!(matches!(
        engine.orchestrator().stop_test(id),
        Err(EngineError::NotRunning(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_calls_are_exact() {
    let (engine, calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );
    let duration = Duration::from_millis(300);
    let config = TestConfiguration::new(
        "recorded",
        "recording",
        serde_json::Value::Null,
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(record.status, ExecutionStatus::Completed);
    assert_eq!(calls.initialize.load(Ordering::SeqCst), 1);
    assert_eq!(calls.execute.load(Ordering::SeqCst), 1);
    assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn initialize_failure_skips_execute_and_cleanup() {
    let (engine, calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        true,
        ExecBehavior::RunToEnd,
    );
    let duration = Duration::from_millis(300);
    let config = TestConfiguration::new(
        "bad init",
        "recording",
        serde_json::Value::Null,
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("initialize failed"));
    assert_eq!(calls.initialize.load(Ordering::SeqCst), 1);
    assert_eq!(calls.execute.load(Ordering::SeqCst), 0);
    assert_eq!(calls.cleanup.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_error_fails_with_message() {
    let (engine, calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::FailImmediately,
    );
    let duration = Duration::from_millis(300);
    let config = TestConfiguration::new("failing", "recording", serde_json::Value::Null, duration);

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.error_message.unwrap().contains("synthetic failure"));
    assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn panic_is_contained_at_the_driver_boundary() {
    let (engine, calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::Panic,
    );
    let duration = Duration::from_millis(300);
    let config = TestConfiguration::new("panicky", "recording", serde_json::Value::Null, duration);

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("workload faulted"));
    assert!(message.contains("synthetic panic"));
    assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reap_removes_only_old_terminal_executions() {
    let (engine, _calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );

    let quick = Duration::from_millis(100);
    let quick_config =
        TestConfiguration::new("quick", "recording", serde_json::Value::Null, quick);
    let quick_id = engine
        .orchestrator()
        .start_test(quick_config, params(quick))
        .unwrap();
    wait_terminal(&engine, quick_id, Duration::from_secs(2)).await;

    let slow = Duration::from_secs(30);
    let slow_config = TestConfiguration::new("slow", "recording", serde_json::Value::Null, slow);
    let slow_id = engine
        .orchestrator()
        .start_test(slow_config, params(slow))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Running executions survive even with a zero max age.
    assert_eq!(engine.orchestrator().reap_completed(Duration::ZERO), 1);
    assert!(engine.orchestrator().get_status(slow_id).is_ok());
    assert!(matches!(
        engine.orchestrator().get_status(quick_id),
        Err(EngineError::NotFound(_))
    ));

    // Reaping twice removes nothing the second time.
    assert_eq!(engine.orchestrator().reap_completed(Duration::ZERO), 0);

    engine.orchestrator().stop_test(slow_id).unwrap();
    wait_terminal(&engine, slow_id, Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn emergency_stop_fails_execution_with_reason() {
    let (engine, _calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );
    let duration = Duration::from_secs(30);
    let config = TestConfiguration::new("doomed", "recording", serde_json::Value::Null, duration);

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    engine
        .orchestrator()
        .emergency_stop(id, "operator pulled the plug")
        .unwrap();

    let record = engine.orchestrator().get_status(id).unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert_eq!(
        record.error_message.as_deref(),
        Some("operator pulled the plug")
    );
    assert!(record.end_time.is_some());

    // The workload observes the cancellation shortly after.
    wait_terminal(&engine, id, Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn run_test_produces_a_scored_result() {
    let (engine, _calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );
    let duration = Duration::from_millis(300);
    let config = TestConfiguration::new("scored", "recording", serde_json::Value::Null, duration);

    let result = engine.run_test(config, params(duration)).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.passed);
    assert!(result.score >= 70.0);
    assert!(!result.metrics.is_empty());
    assert!(result.errors.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn config_file_execution_round_trips() {
    let (engine, _calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("test.json");
    std::fs::write(
        &path,
        serde_json::json!({
            "name": "from file",
            "plugin": "recording",
            "duration": {"secs": 0, "nanos": 200_000_000},
            "config": {"intensity": 40, "concurrency": 2}
        })
        .to_string(),
    )
    .unwrap();

    let result = engine.execute_config_file(&path).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.passed);
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_completion_times_out_with_emergency_stop() {
    let (engine, _calls) = engine_with_recorder(
        healthy_probe(),
        EngineConfig::default(),
        false,
        ExecBehavior::RunToEnd,
    );
    let duration = Duration::from_secs(30);
    let config = TestConfiguration::new("stuck", "recording", serde_json::Value::Null, duration);

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = engine
        .wait_for_completion(id, Duration::from_millis(50), Duration::from_millis(300))
        .await
        .unwrap();

    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("test execution timeout"));
}
