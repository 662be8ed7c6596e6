//! Violation and alert types for safety monitoring.
//!
//! A [`Violation`] is one observation that a metric exceeded its limit; an
//! [`Alert`] is the subscriber-facing notification derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::models::{FieldMap, FieldValue};

/// Which resource (or meta-condition) a violation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Cpu,
    Memory,
    Disk,
    Network,
    Temperature,
    ViolationRate,
    MemoryPressure,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::Cpu => "cpu",
            ViolationKind::Memory => "memory",
            ViolationKind::Disk => "disk",
            ViolationKind::Network => "network",
            ViolationKind::Temperature => "temperature",
            ViolationKind::ViolationRate => "violation_rate",
            ViolationKind::MemoryPressure => "memory_pressure",
        };
        f.write_str(s)
    }
}

/// Severity classes, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single observation that a metric exceeded its configured limit.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub current_value: f64,
    pub limit: f64,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// True when the condition warrants cutting the execution immediately.
    pub critical: bool,
}

/// Subscriber-facing notification synthesised from a violation.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: ViolationKind,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub metadata: FieldMap,
}

impl From<&Violation> for Alert {
    fn from(violation: &Violation) -> Self {
        let mut metadata = FieldMap::new();
        metadata.insert("current_value".into(), violation.current_value.into());
        metadata.insert("limit".into(), violation.limit.into());
        metadata.insert("critical".into(), FieldValue::Bool(violation.critical));
        Alert {
            kind: violation.kind,
            message: violation.message.clone(),
            severity: violation.severity,
            timestamp: violation.timestamp,
            metadata,
        }
    }
}

/// Classify a percentage reading against the monitor's global thresholds.
///
/// Critical above the emergency threshold, Error at or above the alert
/// threshold, Warning otherwise (the reading already exceeded its limit to
/// get here).
pub fn classify(value: f64, alert_threshold: f64, emergency_threshold: f64) -> Severity {
    if value > emergency_threshold {
        Severity::Critical
    } else if value >= alert_threshold {
        Severity::Error
    } else {
        Severity::Warning
    }
}
