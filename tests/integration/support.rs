//! Shared fixtures: a deterministic probe and a recording plugin mock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use stressforge::core::models::{FieldMap, SafetyLimits, SystemMetrics, TestParams};
use stressforge::error::{EngineError, Result};
use stressforge::probe::{SystemProbe, ThermalReading};
use stressforge::workloads::StressPlugin;
use stressforge::{EngineConfig, StressEngine};

/// Probe returning scripted values. CPU readings walk through `cpu_pattern`
/// one step per call; the pattern either cycles or holds its last value.
pub struct FakeProbe {
    cpu_pattern: Vec<f64>,
    cycle: bool,
    cpu_calls: AtomicUsize,
    memory: f64,
    disk: f64,
    temperature: f64,
    authoritative: bool,
    network: AtomicU64,
}

impl FakeProbe {
    pub fn steady(cpu: f64, memory: f64, disk: f64, temperature: f64) -> Self {
        Self {
            cpu_pattern: vec![cpu],
            cycle: false,
            cpu_calls: AtomicUsize::new(0),
            memory,
            disk,
            temperature,
            authoritative: true,
            network: AtomicU64::new(0),
        }
    }

    /// Healthy host except for the scripted CPU readings.
    pub fn cpu_sequence(pattern: Vec<f64>, cycle: bool) -> Self {
        Self {
            cpu_pattern: pattern,
            cycle,
            cpu_calls: AtomicUsize::new(0),
            memory: 40.0,
            disk: 20.0,
            temperature: 30.0,
            authoritative: true,
            network: AtomicU64::new(0),
        }
    }

    fn cpu_at(&self, index: usize) -> f64 {
        if self.cpu_pattern.is_empty() {
            return 0.0;
        }
        if self.cycle {
            self.cpu_pattern[index % self.cpu_pattern.len()]
        } else {
            self.cpu_pattern[index.min(self.cpu_pattern.len() - 1)]
        }
    }
}

impl SystemProbe for FakeProbe {
    fn cpu_percent(&self) -> Result<f64> {
        let index = self.cpu_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.cpu_at(index))
    }

    fn memory_percent(&self) -> Result<f64> {
        Ok(self.memory)
    }

    fn disk_percent(&self) -> Result<f64> {
        Ok(self.disk)
    }

    fn network_bytes(&self) -> Result<u64> {
        // ~1 Mbps when sampled once per second.
        Ok(self.network.fetch_add(125_000, Ordering::Relaxed))
    }

    fn temperature(&self) -> Result<ThermalReading> {
        Ok(ThermalReading {
            celsius: self.temperature,
            authoritative: self.authoritative,
        })
    }

    fn process_memory_bytes(&self) -> Result<u64> {
        Ok(0)
    }

    fn snapshot(&self) -> Result<SystemMetrics> {
        // Peek at the CPU value without advancing the scripted sequence.
        let index = self.cpu_calls.load(Ordering::Relaxed).saturating_sub(1);
        let mut snapshot = SystemMetrics {
            timestamp: chrono::Utc::now().timestamp(),
            ..Default::default()
        };
        snapshot.cpu.usage_percent = self.cpu_at(index);
        snapshot.cpu.core_count = 4;
        snapshot.memory.usage_percent = self.memory;
        snapshot.memory.total_bytes = 16 * 1024 * 1024 * 1024;
        snapshot.disk.usage_percent = self.disk;
        Ok(snapshot)
    }
}

/// How the recording plugin behaves inside `execute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecBehavior {
    /// Sleep out the duration, observing cancellation.
    RunToEnd,
    /// Fail immediately with a plugin fault error.
    FailImmediately,
    /// Panic, exercising the driver's fault boundary.
    Panic,
}

#[derive(Default)]
pub struct CallLog {
    pub initialize: AtomicUsize,
    pub execute: AtomicUsize,
    pub cleanup: AtomicUsize,
}

/// Mock plugin that records lifecycle calls.
pub struct RecordingPlugin {
    calls: Arc<CallLog>,
    fail_initialize: bool,
    behavior: ExecBehavior,
}

impl RecordingPlugin {
    pub fn new(calls: Arc<CallLog>, fail_initialize: bool, behavior: ExecBehavior) -> Self {
        Self {
            calls,
            fail_initialize,
            behavior,
        }
    }
}

#[async_trait]
impl StressPlugin for RecordingPlugin {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn version(&self) -> &'static str {
        "0.0.0"
    }

    fn description(&self) -> &'static str {
        "lifecycle-recording mock workload"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    fn initialize(&self, _config: &serde_json::Value) -> Result<()> {
        self.calls.initialize.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize {
            return Err(EngineError::invalid_config("synthetic initialize failure"));
        }
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, params: TestParams) -> Result<()> {
        self.calls.execute.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            ExecBehavior::FailImmediately => Err(EngineError::plugin_fault("synthetic failure")),
            ExecBehavior::Panic => panic!("synthetic panic"),
            ExecBehavior::RunToEnd => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(params.duration) => Ok(()),
                }
            }
        }
    }

    fn cleanup(&self) -> Result<()> {
        self.calls.cleanup.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_metrics(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "execute_calls".into(),
            self.calls.execute.load(Ordering::SeqCst).into(),
        );
        fields
    }

    fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits::default()
    }

    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Engine over a fake probe, with a recording plugin registered alongside
/// the builtins. Returns the engine plus the recording plugin's call log.
pub fn engine_with_recorder(
    probe: FakeProbe,
    config: EngineConfig,
    fail_initialize: bool,
    behavior: ExecBehavior,
) -> (StressEngine, Arc<CallLog>) {
    let engine = StressEngine::with_probe(Arc::new(probe), config);
    let calls = Arc::new(CallLog::default());
    let registered = Arc::clone(&calls);
    engine.registry().register(move || {
        Arc::new(RecordingPlugin::new(
            Arc::clone(&registered),
            fail_initialize,
            behavior,
        ))
    });
    (engine, calls)
}

pub fn engine_with_probe(probe: FakeProbe, config: EngineConfig) -> StressEngine {
    StressEngine::with_probe(Arc::new(probe), config)
}

/// Poll an orchestrator until the execution reaches a terminal state or the
/// timeout elapses.
pub async fn wait_terminal(
    engine: &StressEngine,
    id: uuid::Uuid,
    timeout: Duration,
) -> stressforge::ExecutionRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let record = engine.orchestrator().get_status(id).expect("known execution");
        if record.status.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "execution {id} did not finish within {timeout:?} (status {})",
            record.status
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
