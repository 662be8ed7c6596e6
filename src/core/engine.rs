//! Composition root wiring the probe, bus, collector, monitor, registry,
//! and orchestrator together.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::collector::MetricsCollector;
use super::config::EngineConfig;
use super::events::{EngineEvent, EventBus};
use super::models::{
    ExecutionRecord, ExecutionStatus, FieldValue, MetricPoint, TestConfiguration, TestParams,
    TestResult,
};
use super::orchestrator::TestOrchestrator;
use super::registry::PluginRegistry;
use super::safety::SafetyMonitor;
use crate::error::{EngineError, Result};
use crate::probe::{SysinfoProbe, SystemProbe};

/// Grace period past the configured duration before a waited-on execution is
/// force-stopped.
const COMPLETION_GRACE: Duration = Duration::from_secs(30);

/// Minimum score for a completed execution to count as passed.
const PASS_SCORE: f64 = 70.0;

/// Health of one engine component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub healthy: bool,
    pub error: Option<String>,
}

/// The assembled stress-testing engine.
///
/// Every long-lived piece of shared state (registry, snapshot cell,
/// violation ring) is owned here and handed to the orchestrator as an
/// explicit handle.
pub struct StressEngine {
    probe: Arc<dyn SystemProbe>,
    bus: EventBus,
    registry: Arc<PluginRegistry>,
    monitor: Arc<SafetyMonitor>,
    collector: Arc<MetricsCollector>,
    orchestrator: TestOrchestrator,
}

impl StressEngine {
    /// Engine on the real host probe.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_probe(Arc::new(SysinfoProbe::new()), config)
    }

    /// Engine on a caller-supplied probe; tests substitute a deterministic
    /// fake here.
    pub fn with_probe(probe: Arc<dyn SystemProbe>, config: EngineConfig) -> Self {
        let bus = EventBus::default();
        let monitor = Arc::new(SafetyMonitor::new(
            Arc::clone(&probe),
            config.effective_safety(),
            bus.clone(),
        ));
        let collector = Arc::new(MetricsCollector::new(
            Arc::clone(&probe),
            config.collector,
            bus.clone(),
        ));
        let registry = Arc::new(PluginRegistry::with_builtins());
        let orchestrator = TestOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&monitor),
            Arc::clone(&collector),
            bus.clone(),
            config.limits,
        );

        Self {
            probe,
            bus,
            registry,
            monitor,
            collector,
            orchestrator,
        }
    }

    /// Begin global host sampling.
    pub fn start(&self) {
        self.collector.start();
    }

    /// Stop global sampling. Running executions are unaffected.
    pub fn shutdown(&self) {
        self.collector.stop();
    }

    pub fn orchestrator(&self) -> &TestOrchestrator {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &Arc<SafetyMonitor> {
        &self.monitor
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Poll until the execution reaches a terminal state. When `timeout`
    /// expires first, the execution is emergency-stopped and the final
    /// record returned.
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<ExecutionRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.orchestrator.get_status(execution_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                self.orchestrator
                    .emergency_stop(execution_id, "test execution timeout")?;
                return self.orchestrator.get_status(execution_id);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Run one test to completion and aggregate the outcome into a scored
    /// [`TestResult`].
    pub async fn run_test(
        &self,
        config: TestConfiguration,
        params: TestParams,
    ) -> Result<TestResult> {
        let config_id = config.id;
        let timeout = params.duration + COMPLETION_GRACE;
        let id = self.orchestrator.start_test(config, params)?;
        let record = self
            .wait_for_completion(id, Duration::from_millis(250), timeout)
            .await?;

        let metrics = self.orchestrator.get_metrics(id).unwrap_or_default();
        let score = score_execution(&record, &metrics);
        let passed = record.status == ExecutionStatus::Completed && score >= PASS_SCORE;

        Ok(TestResult {
            execution_id: id,
            config_id,
            status: record.status,
            duration: record.duration,
            metrics,
            score,
            passed,
            errors: record.error_message.into_iter().collect(),
        })
    }

    /// Load a test configuration from a JSON file and run it.
    ///
    /// Missing fields fall back to defaults (60 s duration, default safety
    /// limits); `intensity` and `concurrency` keys inside the plugin config
    /// are lifted into the test parameters.
    pub async fn execute_config_file(&self, path: &Path) -> Result<TestResult> {
        let data = std::fs::read_to_string(path)?;
        let mut config: TestConfiguration = serde_json::from_str(&data)
            .map_err(|err| EngineError::invalid_config(format!("{}: {err}", path.display())))?;
        if config.duration.is_zero() {
            config.duration = Duration::from_secs(60);
        }

        let mut params = TestParams {
            duration: config.duration,
            ..Default::default()
        };
        if let Some(map) = config.config.as_object() {
            if let Some(intensity) = map.get("intensity").and_then(|v| v.as_u64()) {
                params.intensity = intensity.min(100) as u8;
            }
            if let Some(concurrency) = map.get("concurrency").and_then(|v| v.as_u64()) {
                params.concurrency = concurrency as usize;
            }
        }

        self.run_test(config, params).await
    }

    /// Health sweep over the probe and every registered plugin.
    pub fn health_check(&self) -> Vec<ComponentHealth> {
        let mut components = Vec::new();

        let probe_result = self.probe.snapshot();
        components.push(ComponentHealth {
            name: "probe".into(),
            healthy: probe_result.is_ok(),
            error: probe_result.err().map(|err| err.to_string()),
        });

        for (name, result) in self.registry.health_check() {
            components.push(ComponentHealth {
                name: format!("plugin:{name}"),
                healthy: result.is_ok(),
                error: result.err().map(|err| err.to_string()),
            });
        }

        components
    }
}

/// Score an execution 0-100: deductions for abnormal endings and for samples
/// showing the host pinned above 95% CPU.
fn score_execution(record: &ExecutionRecord, metrics: &[MetricPoint]) -> f64 {
    let mut base = 100.0;
    match record.status {
        ExecutionStatus::Failed => base -= 50.0,
        ExecutionStatus::Stopped => base -= 25.0,
        _ => {}
    }

    if metrics.is_empty() {
        return base * 0.5;
    }

    let mut performance: f64 = 1.0;
    for point in metrics {
        if let Some(FieldValue::Float(cpu)) = point.fields.get("cpu_percent") {
            if *cpu > 95.0 {
                performance *= 0.9;
            }
        }
    }
    base * performance.max(0.5)
}
