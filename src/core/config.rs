//! Engine configuration consumed from an external loader.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::collector::CollectorConfig;
use super::models::SafetyLimits;
use super::safety::SafetyConfig;

/// Resource ceiling applied on top of every plugin's declared limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimits {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_disk_percent: f64,
    /// Readings above this are always classed Critical, regardless of the
    /// monitor's own emergency threshold.
    pub emergency_stop_threshold: f64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 70.0,
            max_disk_percent: 90.0,
            emergency_stop_threshold: 95.0,
        }
    }
}

impl GlobalLimits {
    /// Tighten `limits` by the global ceiling. Network is not part of the
    /// ceiling and passes through unchanged.
    pub fn apply_to(&self, limits: SafetyLimits) -> SafetyLimits {
        SafetyLimits {
            max_cpu_percent: limits.max_cpu_percent.min(self.max_cpu_percent),
            max_memory_percent: limits.max_memory_percent.min(self.max_memory_percent),
            max_disk_percent: limits.max_disk_percent.min(self.max_disk_percent),
            max_network_mbps: limits.max_network_mbps,
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_cpu_percent", self.max_cpu_percent),
            ("max_memory_percent", self.max_memory_percent),
            ("max_disk_percent", self.max_disk_percent),
        ] {
            if !(1.0..=100.0).contains(&value) {
                anyhow::bail!("invalid {name}: {value}");
            }
        }
        Ok(())
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub safety: SafetyConfig,
    pub limits: GlobalLimits,
    pub collector: CollectorConfig,
}

impl EngineConfig {
    /// Load from a JSON file, falling back to defaults for missing fields.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path:?}"))?;
        let config: EngineConfig = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config file: {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        if self.safety.check_interval.is_zero() {
            anyhow::bail!("safety check_interval must be non-zero");
        }
        if self.collector.collection_interval.is_zero() {
            anyhow::bail!("collector collection_interval must be non-zero");
        }
        Ok(())
    }

    /// The monitor configuration with the global emergency ceiling folded in.
    pub fn effective_safety(&self) -> SafetyConfig {
        let mut safety = self.safety.clone();
        safety.emergency_threshold = safety
            .emergency_threshold
            .min(self.limits.emergency_stop_threshold);
        safety
    }
}
