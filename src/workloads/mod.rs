//! Workload plugins: synthetic load generators driven by the orchestrator.
//!
//! Each plugin follows the same contract: parse its configuration in
//! `initialize`, generate load in `execute` until the duration elapses or the
//! cancellation token fires, and release everything in `cleanup`. Plugin
//! state lives behind interior mutability so one instance can be shared
//! between the execution driver and the metrics collector.

mod cpu;
mod io;
mod memory;

pub use cpu::CpuStressPlugin;
pub use io::IoStressPlugin;
pub use memory::MemoryStressPlugin;

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::models::{FieldMap, SafetyLimits, TestParams};
use crate::error::{EngineError, Result};

/// Contract every stress workload implements.
#[async_trait]
pub trait StressPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn description(&self) -> &'static str;

    /// Machine-readable description of the accepted configuration keys.
    fn config_schema(&self) -> serde_json::Value;

    /// Parse and validate configuration, set defaults, reserve scratch state.
    /// Idempotent with respect to [`cleanup`](Self::cleanup).
    fn initialize(&self, config: &serde_json::Value) -> Result<()>;

    /// Run the workload until the duration elapses or `cancel` fires.
    /// Workers observe cancellation at intervals of one second or less.
    async fn execute(&self, cancel: CancellationToken, params: TestParams) -> Result<()>;

    /// Release all resources acquired in initialize/execute. Safe to call
    /// even if initialize never ran or execute was cancelled mid-way.
    fn cleanup(&self) -> Result<()>;

    /// Snapshot of plugin-specific counters.
    fn current_metrics(&self) -> FieldMap;

    /// Advisory upper bound the workload considers acceptable.
    fn safety_limits(&self) -> SafetyLimits;

    /// Quick self-test verifying the plugin can run.
    fn health_check(&self) -> Result<()>;
}

/// Computes the intensity cap during an execution's ramp-up phase.
///
/// With ramp-up enabled, the first 10% of the test duration (at least ten
/// seconds, never more than the whole duration) is split into ten equal
/// steps, scaling intensity linearly from zero to the target.
#[derive(Debug, Clone)]
pub struct IntensityPacer {
    target: u8,
    ramp_duration: Option<Duration>,
    started: Instant,
}

const RAMP_STEPS: u32 = 10;
const MIN_RAMP: Duration = Duration::from_secs(10);

impl IntensityPacer {
    pub fn new(target: u8, ramp_up: bool, total: Duration) -> Self {
        let ramp_duration = ramp_up.then(|| {
            let tenth = total.mul_f64(0.1);
            tenth.max(MIN_RAMP).min(total)
        });
        Self {
            target,
            ramp_duration,
            started: Instant::now(),
        }
    }

    /// Intensity cap right now.
    pub fn current(&self) -> u8 {
        self.at(self.started.elapsed())
    }

    /// Intensity cap after `elapsed` time. Pure, for testing the curve.
    pub fn at(&self, elapsed: Duration) -> u8 {
        let Some(ramp) = self.ramp_duration else {
            return self.target;
        };
        if elapsed >= ramp {
            return self.target;
        }
        let progress = elapsed.as_secs_f64() / ramp.as_secs_f64();
        let step = (progress * RAMP_STEPS as f64) as u32;
        (self.target as u32 * step / RAMP_STEPS).min(self.target as u32) as u8
    }

    pub fn ramp_duration(&self) -> Option<Duration> {
        self.ramp_duration
    }
}

/// How long a worker should idle after one unit of work, given the requested
/// intensity and how long the work actually took.
///
/// Intensity 100 never idles. Below that, a worker that finished its unit
/// inside the work budget sleeps out the rest of the duty cycle. Intensity 0
/// is handled by the caller: no work at all, just cancellation polling.
pub fn duty_cycle_idle(intensity: u8, work_elapsed: Duration) -> Option<Duration> {
    if intensity >= 100 {
        return None;
    }
    let work_budget = Duration::from_millis(u64::from(intensity));
    let idle = Duration::from_millis(u64::from(100 - intensity));
    (work_elapsed < work_budget).then_some(idle)
}

/// Sleep used by idle workers (intensity 0) between cancellation checks.
pub const IDLE_POLL: Duration = Duration::from_millis(100);

/// A byte count that deserializes from either a raw number or a
/// human-friendly string like `"64KB"`, `"512MB"`, `"1GB"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const KIB: u64 = 1024;
    pub const MIB: u64 = 1024 * 1024;
    pub const GIB: u64 = 1024 * 1024 * 1024;

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn whole_mib(self) -> u64 {
        self.0 / Self::MIB
    }
}

impl FromStr for ByteSize {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        let (digits, multiplier) = if let Some(rest) = upper.strip_suffix("GB") {
            (rest, Self::GIB)
        } else if let Some(rest) = upper.strip_suffix("MB") {
            (rest, Self::MIB)
        } else if let Some(rest) = upper.strip_suffix("KB") {
            (rest, Self::KIB)
        } else if let Some(rest) = upper.strip_suffix('B') {
            (rest, 1)
        } else {
            (upper.as_str(), 1)
        };
        let value: u64 = digits
            .trim()
            .parse()
            .map_err(|_| EngineError::invalid_config(format!("invalid size value: {s:?}")))?;
        Ok(ByteSize(value * multiplier))
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a byte count or a size string like \"64MB\"")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: serde::de::Error>(self, v: i64) -> std::result::Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("size must be non-negative"))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<ByteSize, E> {
                v.parse().map_err(|err| E::custom(format!("{err}")))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Decode a plugin configuration value, treating `null` as "all defaults".
pub(crate) fn parse_config<T>(config: &serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|err| EngineError::invalid_config(err.to_string()))
}
