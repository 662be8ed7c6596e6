//! Host observation interface.
//!
//! The engine never reads host counters directly; everything goes through
//! [`SystemProbe`] so tests can substitute a deterministic fake.

mod sysinfo_probe;

pub use sysinfo_probe::SysinfoProbe;

use crate::core::models::SystemMetrics;
use crate::error::Result;

/// A temperature sample plus whether it came from a real thermal source.
///
/// When no thermal sensor is available the probe reports a safe default and
/// marks the reading non-authoritative; consumers must not raise violations
/// from such readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalReading {
    pub celsius: f64,
    pub authoritative: bool,
}

/// Read access to current host state.
///
/// All accessors may fail with a recoverable [`ProbeFailure`]; a failed read
/// never poisons the probe.
///
/// [`ProbeFailure`]: crate::error::EngineError::ProbeFailure
pub trait SystemProbe: Send + Sync {
    /// Global CPU utilisation in percent, computed from the delta between
    /// this call and the previous one. The first call returns 0 and records
    /// the baseline.
    fn cpu_percent(&self) -> Result<f64>;

    /// Memory utilisation in percent: (total - available) / total.
    fn memory_percent(&self) -> Result<f64>;

    /// Used percentage of the root volume.
    fn disk_percent(&self) -> Result<f64>;

    /// Aggregate bytes moved across non-loopback interfaces since boot.
    /// This is a rolling counter; callers compute rates from deltas.
    fn network_bytes(&self) -> Result<u64>;

    /// Temperature from the first available thermal source.
    fn temperature(&self) -> Result<ThermalReading>;

    /// Resident memory of the current process in bytes.
    fn process_memory_bytes(&self) -> Result<u64>;

    /// Full snapshot of CPU, memory, disk, and network counters.
    fn snapshot(&self) -> Result<SystemMetrics>;
}
