//! Safety monitoring: limit evaluation, violation bookkeeping, and the
//! emergency-stop signal.

mod alerts;

pub use alerts::{classify, Alert, Severity, Violation, ViolationKind};

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::events::{EngineEvent, EventBus};
use crate::core::models::SafetyLimits;
use crate::probe::SystemProbe;

/// Violations older than this are evicted from the ring.
const VIOLATION_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Capacity of the emergency-stop signal channel. The first signal is enough
/// to cut an execution; overflow is dropped.
const EMERGENCY_CHANNEL_CAPACITY: usize = 8;

/// Window used by the violation-rate gate.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Host memory below which the memory-pressure check stays silent.
const PRESSURE_MIN_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Safety monitor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub check_interval: Duration,
    /// Percent at which a violation is classed Error.
    pub alert_threshold: f64,
    /// Percent above which a violation is classed Critical.
    pub emergency_threshold: f64,
    /// Gates the violation-rate auto-stop.
    pub auto_stop_enabled: bool,
    pub ramp_up_enabled: bool,
    pub ramp_up_duration: Duration,
    pub ramp_up_steps: u32,
    /// Window after an Error/Critical violation during which the monitor
    /// reports "in cooldown".
    pub cooldown_period: Duration,
    /// Error/Critical violations tolerated per minute before auto-stop.
    pub max_violations_per_min: usize,
    pub temp_warning_celsius: f64,
    pub temp_critical_celsius: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            alert_threshold: 85.0,
            emergency_threshold: 95.0,
            auto_stop_enabled: true,
            ramp_up_enabled: true,
            ramp_up_duration: Duration::from_secs(30),
            ramp_up_steps: 10,
            cooldown_period: Duration::from_secs(60),
            max_violations_per_min: 5,
            temp_warning_celsius: 85.0,
            temp_critical_celsius: 90.0,
        }
    }
}

/// Coarse health classification derived from recent violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Warning,
    Degraded,
    Critical,
}

/// Current host readings as seen by the monitor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemHealth {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub temperature_celsius: f64,
}

/// Aggregate safety state exposed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyStatus {
    pub overall: OverallHealth,
    pub recent_violations: usize,
    pub last_violation: Option<Violation>,
    pub system_health: SystemHealth,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Evaluates host samples against safety limits, records violations, and
/// raises the emergency-stop signal on critical conditions.
///
/// The violation ring is single-writer (the monitor itself); readers take
/// snapshots.
pub struct SafetyMonitor {
    probe: Arc<dyn SystemProbe>,
    config: SafetyConfig,
    bus: EventBus,
    violations: Mutex<VecDeque<Violation>>,
    last_network: Mutex<Option<(Instant, u64)>>,
    emergency_tx: broadcast::Sender<String>,
}

impl SafetyMonitor {
    pub fn new(probe: Arc<dyn SystemProbe>, config: SafetyConfig, bus: EventBus) -> Self {
        let (emergency_tx, _) = broadcast::channel(EMERGENCY_CHANNEL_CAPACITY);
        Self {
            probe,
            config,
            bus,
            violations: Mutex::new(VecDeque::new()),
            last_network: Mutex::new(None),
            emergency_tx,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Subscribe to emergency-stop signals. The payload is the stop reason.
    pub fn subscribe_emergency(&self) -> broadcast::Receiver<String> {
        self.emergency_tx.subscribe()
    }

    /// Evaluate the current host state against `limits`.
    ///
    /// Returns the first violation found (CPU, then memory, disk, network),
    /// after recording it and emitting an alert. Probe failures are logged
    /// and treated as "no reading".
    pub fn check_limits(&self, limits: &SafetyLimits) -> Option<Violation> {
        match self.probe.cpu_percent() {
            Ok(cpu) if cpu > limits.max_cpu_percent => {
                let violation = self.percent_violation(
                    ViolationKind::Cpu,
                    "CPU usage",
                    cpu,
                    limits.max_cpu_percent,
                );
                self.record(violation.clone());
                return Some(violation);
            }
            Err(err) => log::debug!("cpu reading unavailable: {err}"),
            _ => {}
        }

        match self.probe.memory_percent() {
            Ok(mem) if mem > limits.max_memory_percent => {
                let violation = self.percent_violation(
                    ViolationKind::Memory,
                    "Memory usage",
                    mem,
                    limits.max_memory_percent,
                );
                self.record(violation.clone());
                return Some(violation);
            }
            Err(err) => log::debug!("memory reading unavailable: {err}"),
            _ => {}
        }

        match self.probe.disk_percent() {
            Ok(disk) if disk > limits.max_disk_percent => {
                let violation = self.percent_violation(
                    ViolationKind::Disk,
                    "Disk usage",
                    disk,
                    limits.max_disk_percent,
                );
                self.record(violation.clone());
                return Some(violation);
            }
            Err(err) => log::debug!("disk reading unavailable: {err}"),
            _ => {}
        }

        if let Some(mbps) = self.network_rate_mbps() {
            if mbps > limits.max_network_mbps {
                // Network pressure is never grounds for an emergency stop.
                let severity = if mbps > limits.max_network_mbps * 2.0 {
                    Severity::Error
                } else {
                    Severity::Warning
                };
                let violation = Violation {
                    kind: ViolationKind::Network,
                    current_value: mbps,
                    limit: limits.max_network_mbps,
                    severity,
                    message: format!(
                        "Network usage {:.1} Mbps exceeds limit {:.1} Mbps",
                        mbps, limits.max_network_mbps
                    ),
                    timestamp: Utc::now(),
                    critical: false,
                };
                self.record(violation.clone());
                return Some(violation);
            }
        }

        None
    }

    /// Host-level checks that are independent of any workload's limits:
    /// temperature, violation rate, and memory pressure. Emergency conditions
    /// are signalled on the emergency channel.
    pub fn periodic_check(&self) {
        self.check_temperature();
        self.check_violation_rate();
        self.check_memory_pressure();
    }

    fn check_temperature(&self) {
        let reading = match self.probe.temperature() {
            Ok(reading) => reading,
            Err(err) => {
                log::debug!("temperature reading unavailable: {err}");
                return;
            }
        };
        if !reading.authoritative {
            log::debug!("thermal reading not authoritative, skipping temperature check");
            return;
        }

        let temp = reading.celsius;
        if temp >= self.config.temp_critical_celsius {
            let violation = Violation {
                kind: ViolationKind::Temperature,
                current_value: temp,
                limit: self.config.temp_critical_celsius,
                severity: Severity::Critical,
                message: format!("System temperature {temp:.1}°C is too high"),
                timestamp: Utc::now(),
                critical: true,
            };
            self.record(violation);
            self.send_emergency(format!("critical temperature: {temp:.1}°C"));
        } else if temp >= self.config.temp_warning_celsius {
            let violation = Violation {
                kind: ViolationKind::Temperature,
                current_value: temp,
                limit: self.config.temp_warning_celsius,
                severity: Severity::Warning,
                message: format!("System temperature {temp:.1}°C is elevated"),
                timestamp: Utc::now(),
                critical: false,
            };
            self.record(violation);
        }
    }

    fn check_violation_rate(&self) {
        if !self.config.auto_stop_enabled {
            return;
        }
        let count = self
            .recent_violations(RATE_WINDOW)
            .iter()
            .filter(|v| v.severity >= Severity::Error)
            .count();
        if count > self.config.max_violations_per_min {
            self.send_emergency(format!("too many violations: {count} in last minute"));
        }
    }

    fn check_memory_pressure(&self) {
        let rss = match self.probe.process_memory_bytes() {
            Ok(rss) => rss,
            Err(err) => {
                log::debug!("process memory reading unavailable: {err}");
                return;
            }
        };
        let snapshot = match self.probe.snapshot() {
            Ok(snapshot) => snapshot,
            Err(_) => return,
        };
        let total = snapshot.memory.total_bytes;
        if total < PRESSURE_MIN_TOTAL_BYTES {
            return;
        }
        let percent = rss as f64 / total as f64 * 100.0;
        if percent > 50.0 {
            let violation = Violation {
                kind: ViolationKind::MemoryPressure,
                current_value: percent,
                limit: 50.0,
                severity: Severity::Warning,
                message: "high memory pressure detected".into(),
                timestamp: Utc::now(),
                critical: false,
            };
            self.record(violation);
        }
    }

    /// Snapshot of all retained violations, oldest first.
    pub fn violations(&self) -> Vec<Violation> {
        self.violations
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Violations whose timestamp falls within the trailing `window`.
    pub fn recent_violations(&self, window: Duration) -> Vec<Violation> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.violations
            .lock()
            .map(|ring| {
                ring.iter()
                    .filter(|v| v.timestamp > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True when an Error- or Critical-severity violation occurred within the
    /// cooldown period. Advisory: the orchestrator logs it but does not block
    /// new starts.
    pub fn is_in_cooldown(&self) -> bool {
        self.recent_violations(self.config.cooldown_period)
            .iter()
            .any(|v| v.severity >= Severity::Error)
    }

    /// Intensity cap for the ramp-up phase: a step function climbing from 0
    /// to `target` over the configured ramp-up duration.
    pub fn ramp_up_intensity(&self, elapsed: Duration, target: u8) -> u8 {
        if !self.config.ramp_up_enabled || elapsed >= self.config.ramp_up_duration {
            return target;
        }
        let steps = self.config.ramp_up_steps.max(1);
        let progress = elapsed.as_secs_f64() / self.config.ramp_up_duration.as_secs_f64();
        let current_step = (progress * steps as f64) as u32;
        let step_size = target as f64 / steps as f64;
        ((current_step as f64 * step_size) as u8).min(target)
    }

    /// Aggregate safety state over the last five minutes.
    pub fn status(&self) -> SafetyStatus {
        let recent = self.recent_violations(Duration::from_secs(5 * 60));
        let mut overall = match recent.len() {
            0 => OverallHealth::Healthy,
            1..=3 => OverallHealth::Warning,
            _ => OverallHealth::Degraded,
        };
        if recent.iter().any(|v| v.critical) {
            overall = OverallHealth::Critical;
        }

        SafetyStatus {
            overall,
            recent_violations: recent.len(),
            last_violation: recent.last().cloned(),
            system_health: self.system_health(),
            timestamp: Utc::now(),
        }
    }

    fn system_health(&self) -> SystemHealth {
        SystemHealth {
            cpu_percent: self.probe.cpu_percent().unwrap_or(0.0),
            memory_percent: self.probe.memory_percent().unwrap_or(0.0),
            disk_percent: self.probe.disk_percent().unwrap_or(0.0),
            temperature_celsius: self
                .probe
                .temperature()
                .map(|r| r.celsius)
                .unwrap_or(0.0),
        }
    }

    fn percent_violation(
        &self,
        kind: ViolationKind,
        label: &str,
        value: f64,
        limit: f64,
    ) -> Violation {
        let severity = classify(
            value,
            self.config.alert_threshold,
            self.config.emergency_threshold,
        );
        Violation {
            kind,
            current_value: value,
            limit,
            severity,
            message: format!("{label} {value:.1}% exceeds limit {limit:.1}%"),
            timestamp: Utc::now(),
            critical: severity == Severity::Critical,
        }
    }

    fn record(&self, violation: Violation) {
        if let Ok(mut ring) = self.violations.lock() {
            let cutoff = Utc::now()
                - chrono::Duration::from_std(VIOLATION_RETENTION)
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
            ring.push_back(violation.clone());
            while ring.front().is_some_and(|v| v.timestamp < cutoff) {
                ring.pop_front();
            }
        }

        log::warn!(
            "safety violation recorded kind={} value={:.1} limit={:.1} severity={:?}",
            violation.kind,
            violation.current_value,
            violation.limit,
            violation.severity
        );

        let alert = Alert::from(&violation);
        self.bus.publish(EngineEvent::SafetyViolation(violation));
        self.bus.publish(EngineEvent::SafetyAlert(alert));
    }

    fn send_emergency(&self, reason: String) {
        match self.emergency_tx.send(reason.clone()) {
            Ok(_) => log::error!("emergency stop triggered: {reason}"),
            Err(_) => log::warn!("emergency stop signal dropped (no listeners): {reason}"),
        }
    }

    fn network_rate_mbps(&self) -> Option<f64> {
        let counter = match self.probe.network_bytes() {
            Ok(counter) => counter,
            Err(err) => {
                log::debug!("network reading unavailable: {err}");
                return None;
            }
        };
        let now = Instant::now();
        let mut last = self.last_network.lock().ok()?;
        let rate = last.map(|(at, prev)| {
            let elapsed = now.duration_since(at).as_secs_f64().max(1e-3);
            counter.saturating_sub(prev) as f64 * 8.0 / elapsed / 1_000_000.0
        });
        *last = Some((now, counter));
        rate
    }
}
