//! Safety monitor integration: emergency stops driven by a scripted probe.

use std::sync::atomic::Ordering;
use std::time::Duration;

use stressforge::core::events::EngineEvent;
use stressforge::core::safety::{Severity, ViolationKind};
use stressforge::{EngineConfig, ExecutionStatus, TestConfiguration, TestParams};

use super::support::{engine_with_recorder, wait_terminal, ExecBehavior, FakeProbe};

fn tuned_config(
    check_interval: Duration,
    alert_threshold: f64,
    emergency_threshold: f64,
    max_violations_per_min: usize,
) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.safety.check_interval = check_interval;
    config.safety.alert_threshold = alert_threshold;
    config.safety.emergency_threshold = emergency_threshold;
    config.safety.max_violations_per_min = max_violations_per_min;
    config.limits.emergency_stop_threshold = emergency_threshold;
    config
}

fn params(duration: Duration) -> TestParams {
    TestParams {
        duration,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_cpu_violation_triggers_emergency_stop() {
    // Healthy on the first sample, then pinned at 97% CPU.
    let probe = FakeProbe::cpu_sequence(vec![50.0, 97.0], false);
    let config = tuned_config(Duration::from_millis(100), 85.0, 95.0, 5);
    let (engine, calls) = engine_with_recorder(probe, config, false, ExecBehavior::RunToEnd);

    let mut events = engine.subscribe();
    let duration = Duration::from_secs(10);
    let test_config =
        TestConfiguration::new("hot cpu", "recording", serde_json::Value::Null, duration);
    let id = engine
        .orchestrator()
        .start_test(test_config, params(duration))
        .unwrap();

    let record = wait_terminal(&engine, id, Duration::from_millis(800)).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("critical safety violation"));
    assert!(message.contains("CPU"));

    // Cleanup ran exactly once despite the forced stop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.cleanup.load(Ordering::SeqCst), 1);

    // A critical CPU violation was published on the bus.
    let mut saw_critical = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::SafetyViolation(violation) = event {
            if violation.kind == ViolationKind::Cpu && violation.severity == Severity::Critical {
                saw_critical = true;
            }
        }
    }
    assert!(saw_critical);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn violation_rate_gate_stops_the_execution() {
    // Oscillating load: every other sample breaches the limit at Error class.
    let probe = FakeProbe::cpu_sequence(vec![90.0, 50.0], true);
    let config = tuned_config(Duration::from_millis(100), 85.0, 99.0, 3);
    let (engine, _calls) = engine_with_recorder(probe, config, false, ExecBehavior::RunToEnd);

    let duration = Duration::from_secs(10);
    let test_config =
        TestConfiguration::new("flapping", "recording", serde_json::Value::Null, duration);
    let id = engine
        .orchestrator()
        .start_test(test_config, params(duration))
        .unwrap();

    let record = wait_terminal(&engine, id, Duration::from_secs(3)).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("too many violations"));

    // The fourth Error-class violation tripped the gate.
    let errors = engine
        .monitor()
        .recent_violations(Duration::from_secs(60))
        .iter()
        .filter(|v| v.severity >= Severity::Error)
        .count();
    assert!(errors >= 4, "expected at least 4 error violations, got {errors}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn warning_violations_only_produce_alerts() {
    // 75% CPU breaches the recording plugin's 70% ceiling below the alert
    // threshold: Warning class, no stop.
    let probe = FakeProbe::cpu_sequence(vec![75.0], false);
    let mut config = tuned_config(Duration::from_millis(100), 85.0, 95.0, 50);
    config.limits.max_cpu_percent = 70.0;
    let (engine, _calls) = engine_with_recorder(probe, config, false, ExecBehavior::RunToEnd);

    let mut events = engine.subscribe();
    let duration = Duration::from_millis(600);
    let test_config =
        TestConfiguration::new("warm cpu", "recording", serde_json::Value::Null, duration);
    let id = engine
        .orchestrator()
        .start_test(test_config, params(duration))
        .unwrap();

    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    let mut saw_alert = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::SafetyAlert(alert) = event {
            assert_eq!(alert.severity, Severity::Warning);
            saw_alert = true;
        }
    }
    assert!(saw_alert);
    assert!(!engine.monitor().is_in_cooldown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn critical_temperature_cuts_the_execution() {
    let probe = FakeProbe::steady(20.0, 40.0, 20.0, 92.0);
    let config = tuned_config(Duration::from_millis(100), 85.0, 95.0, 5);
    let (engine, _calls) = engine_with_recorder(probe, config, false, ExecBehavior::RunToEnd);

    let duration = Duration::from_secs(10);
    let test_config =
        TestConfiguration::new("hot box", "recording", serde_json::Value::Null, duration);
    let id = engine
        .orchestrator()
        .start_test(test_config, params(duration))
        .unwrap();

    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record
        .error_message
        .unwrap()
        .contains("critical temperature"));
}
