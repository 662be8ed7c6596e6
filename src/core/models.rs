//! Core data model shared by the orchestrator, plugins, and collectors.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Status of a test execution.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed, Failed,
/// Stopped}`, with a direct `Pending -> Failed` shortcut when plugin
/// initialization fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    /// True for the three end states.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Stopped
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Resource ceilings a workload must stay under.
///
/// Plugins declare their own limits; a test configuration may override them
/// and the engine applies a global ceiling on top. Combining is always
/// point-wise minimum, so an override can only tighten.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
    pub max_network_mbps: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 70.0,
            max_disk_percent: 90.0,
            max_network_mbps: 100.0,
        }
    }
}

impl SafetyLimits {
    /// Point-wise minimum of two limit sets.
    pub fn tightened(&self, other: &SafetyLimits) -> SafetyLimits {
        SafetyLimits {
            max_cpu_percent: self.max_cpu_percent.min(other.max_cpu_percent),
            max_memory_percent: self.max_memory_percent.min(other.max_memory_percent),
            max_disk_percent: self.max_disk_percent.min(other.max_disk_percent),
            max_network_mbps: self.max_network_mbps.min(other.max_network_mbps),
        }
    }
}

/// Declarative description of a stress test, created by an external caller.
///
/// Immutable once an execution has started; the engine keeps its own snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfiguration {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Registered plugin name to run.
    pub plugin: String,
    /// Plugin-specific configuration, interpreted by the plugin itself.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub duration: Duration,
    /// Optional override of the plugin's declared limits.
    #[serde(default)]
    pub safety: Option<SafetyLimits>,
}

impl TestConfiguration {
    pub fn new(
        name: impl Into<String>,
        plugin: impl Into<String>,
        config: serde_json::Value,
        duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            plugin: plugin.into(),
            config,
            duration,
            safety: None,
        }
    }
}

/// Runtime parameters for one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestParams {
    pub duration: Duration,
    /// Fraction of each worker's duty cycle spent doing work, 0-100.
    pub intensity: u8,
    /// Number of worker tasks, at least 1.
    pub concurrency: usize,
    #[serde(default)]
    pub custom: HashMap<String, serde_json::Value>,
}

impl Default for TestParams {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            intensity: 70,
            concurrency: 1,
            custom: HashMap::new(),
        }
    }
}

impl TestParams {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(EngineError::invalid_config("concurrency must be at least 1"));
        }
        if self.intensity > 100 {
            return Err(EngineError::invalid_config(format!(
                "intensity must be 0-100, got {}",
                self.intensity
            )));
        }
        if self.duration.is_zero() {
            return Err(EngineError::invalid_config("duration must be non-zero"));
        }
        Ok(())
    }
}

/// Read-only snapshot of a test execution's state.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub config_id: Uuid,
    pub config_name: String,
    pub plugin: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// End minus start when terminal, elapsed time otherwise.
    pub duration: Duration,
    pub error_message: Option<String>,
}

/// A single numeric or boolean metric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            FieldValue::Int(i) => *i as f64,
            FieldValue::Float(f) => *f,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

/// Map of plugin counters, keyed by metric name.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// One sampled data point attached to an execution.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub execution_id: Uuid,
    /// Producer: `"system"` or a plugin name.
    pub source: String,
    /// Measurement kind, e.g. `"system"` or `"plugin"`.
    pub kind: String,
    pub tags: BTreeMap<String, String>,
    pub fields: FieldMap,
}

/// Aggregated outcome of one finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub execution_id: Uuid,
    pub config_id: Uuid,
    pub status: ExecutionStatus,
    pub duration: Duration,
    pub metrics: Vec<MetricPoint>,
    /// 0-100 quality score derived from the outcome and sampled load.
    pub score: f64,
    pub passed: bool,
    pub errors: Vec<String>,
}

/// Complete host metrics snapshot produced by the collector on each tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: i64, // Unix timestamp
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: DiskMetrics,
    pub network: NetworkMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuMetrics {
    pub usage_percent: f64,
    pub core_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskMetrics {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Aggregate bytes received across non-loopback interfaces (rolling counter).
    pub rx_bytes_total: u64,
    /// Aggregate bytes transmitted across non-loopback interfaces (rolling counter).
    pub tx_bytes_total: u64,
}

impl SystemMetrics {
    /// Flatten the snapshot into metric fields for a [`MetricPoint`].
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("cpu_percent".into(), self.cpu.usage_percent.into());
        fields.insert("memory_percent".into(), self.memory.usage_percent.into());
        fields.insert("memory_used_bytes".into(), self.memory.used_bytes.into());
        fields.insert("disk_percent".into(), self.disk.usage_percent.into());
        fields.insert("network_rx_bytes".into(), self.network.rx_bytes_total.into());
        fields.insert("network_tx_bytes".into(), self.network.tx_bytes_total.into());
        fields
    }
}
