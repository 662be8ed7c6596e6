//! End-to-end workload runs through the orchestrator.

use std::time::Duration;

use stressforge::core::models::FieldValue;
use stressforge::{EngineConfig, ExecutionStatus, TestConfiguration, TestParams};

use super::support::{engine_with_probe, wait_terminal, FakeProbe};

fn quiet_probe() -> FakeProbe {
    FakeProbe::steady(20.0, 40.0, 20.0, 30.0)
}

fn params(duration: Duration) -> TestParams {
    TestParams {
        duration,
        ..Default::default()
    }
}

fn plugin_field(
    points: &[stressforge::core::models::MetricPoint],
    source: &str,
    field: &str,
) -> Vec<i64> {
    points
        .iter()
        .filter(|p| p.source == source)
        .filter_map(|p| match p.fields.get(field) {
            Some(FieldValue::Int(n)) => Some(*n),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_workload_allocates_and_accesses() {
    let engine = engine_with_probe(quiet_probe(), EngineConfig::default());
    let duration = Duration::from_secs(2);
    let config = TestConfiguration::new(
        "memory soak",
        "memory-stress",
        serde_json::json!({
            "alloc_size": "128MB",
            "chunk_size": "32MB",
            "pattern": "sequential",
            "access_type": "read",
            "workers": 2,
            "access_delay": 1
        }),
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(4)).await;
    assert_eq!(record.status, ExecutionStatus::Completed);
    assert!(record.error_message.is_none());

    let points = engine.orchestrator().get_metrics(id).unwrap();
    let allocated = plugin_field(&points, "memory-stress", "allocated_mb");
    assert_eq!(
        allocated.last().copied(),
        Some(128),
        "allocation did not reach the configured size: {allocated:?}"
    );
    let accesses = plugin_field(&points, "memory-stress", "access_count");
    assert!(
        accesses.iter().any(|&n| n > 0),
        "no memory accesses recorded: {accesses:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn io_workload_with_missing_temp_dir_fails_before_execute() {
    let engine = engine_with_probe(quiet_probe(), EngineConfig::default());
    let duration = Duration::from_secs(2);
    let config = TestConfiguration::new(
        "bad io",
        "io-stress",
        serde_json::json!({
            "temp_dir": "/definitely/not/a/real/path"
        }),
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(2)).await;

    assert_eq!(record.status, ExecutionStatus::Failed);
    let message = record.error_message.unwrap();
    assert!(message.contains("temp directory does not exist"));

    // The record stays queryable after the failure.
    assert!(engine
        .orchestrator()
        .list_executions()
        .iter()
        .any(|r| r.id == id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn io_workload_round_trips_against_a_real_directory() {
    let scratch = tempfile::TempDir::new().unwrap();
    let engine = engine_with_probe(quiet_probe(), EngineConfig::default());
    let duration = Duration::from_secs(1);
    let config = TestConfiguration::new(
        "small io",
        "io-stress",
        serde_json::json!({
            "file_size": "256KB",
            "block_size": "32KB",
            "operations": "mixed",
            "workers": 2,
            "temp_dir": scratch.path()
        }),
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(4)).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    let points = engine.orchestrator().get_metrics(id).unwrap();
    let read_ops = plugin_field(&points, "io-stress", "read_ops");
    let write_ops = plugin_field(&points, "io-stress", "write_ops");
    let total: i64 = read_ops.last().copied().unwrap_or(0) + write_ops.last().copied().unwrap_or(0);
    assert!(total > 0, "no io operations recorded");

    // Cleanup removed every scratch file.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "scratch files left behind");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_intensity_workers_idle_but_exit_cleanly() {
    let engine = engine_with_probe(quiet_probe(), EngineConfig::default());
    let duration = Duration::from_millis(500);
    let config = TestConfiguration::new(
        "idle cpu",
        "cpu-stress",
        serde_json::json!({
            "workers": 2,
            "intensity": 0,
            "ramp_up": false
        }),
        duration,
    );

    let id = engine
        .orchestrator()
        .start_test(config, params(duration))
        .unwrap();
    let record = wait_terminal(&engine, id, Duration::from_secs(3)).await;
    assert_eq!(record.status, ExecutionStatus::Completed);

    let points = engine.orchestrator().get_metrics(id).unwrap();
    let ops = plugin_field(&points, "cpu-stress", "total_operations");
    assert!(
        ops.iter().all(|&n| n == 0),
        "idle workers performed work: {ops:?}"
    );
}
