//! Host probe backed by the `sysinfo` crate.

use std::sync::Mutex;

use sysinfo::{
    Components, CpuRefreshKind, Disks, MemoryRefreshKind, Networks, Pid, ProcessRefreshKind,
    ProcessesToUpdate, RefreshKind, System,
};

use super::{SystemProbe, ThermalReading};
use crate::core::models::{
    CpuMetrics, DiskMetrics, MemoryMetrics, NetworkMetrics, SystemMetrics,
};
use crate::error::{EngineError, Result};

/// Temperature reported when no thermal sensor is present.
const THERMAL_FALLBACK_CELSIUS: f64 = 35.0;

struct ProbeState {
    system: System,
    disks: Disks,
    networks: Networks,
    components: Components,
    /// False until the first CPU read has recorded its baseline.
    cpu_primed: bool,
}

/// [`SystemProbe`] implementation reading real host counters.
pub struct SysinfoProbe {
    state: Mutex<ProbeState>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let refresh_kind = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::everything())
            .with_memory(MemoryRefreshKind::everything());

        let system = System::new_with_specifics(refresh_kind);
        let disks = Disks::new_with_refreshed_list();
        let networks = Networks::new_with_refreshed_list();
        let components = Components::new_with_refreshed_list();

        Self {
            state: Mutex::new(ProbeState {
                system,
                disks,
                networks,
                components,
                cpu_primed: false,
            }),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ProbeState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::probe_failure("probe state poisoned"))
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name.starts_with("lo0")
}

fn memory_percent_of(system: &System) -> f64 {
    let total = system.total_memory();
    if total == 0 {
        return 0.0;
    }
    let used = total.saturating_sub(system.available_memory());
    used as f64 / total as f64 * 100.0
}

/// Pick the root volume, falling back to the largest disk when no mount
/// point is exactly `/` (e.g. on Windows).
fn root_disk_usage(disks: &Disks) -> Option<(u64, u64)> {
    let root = disks
        .iter()
        .find(|d| d.mount_point().to_string_lossy() == "/")
        .or_else(|| disks.iter().max_by_key(|d| d.total_space()))?;
    Some((root.total_space(), root.available_space()))
}

impl SystemProbe for SysinfoProbe {
    fn cpu_percent(&self) -> Result<f64> {
        let mut state = self.lock()?;
        state.system.refresh_cpu_usage();
        if !state.cpu_primed {
            state.cpu_primed = true;
            return Ok(0.0);
        }
        Ok(state.system.global_cpu_usage() as f64)
    }

    fn memory_percent(&self) -> Result<f64> {
        let mut state = self.lock()?;
        state.system.refresh_memory();
        Ok(memory_percent_of(&state.system))
    }

    fn disk_percent(&self) -> Result<f64> {
        let mut state = self.lock()?;
        state.disks.refresh(true);
        let (total, available) = root_disk_usage(&state.disks)
            .ok_or_else(|| EngineError::probe_failure("no disks found"))?;
        if total == 0 {
            return Ok(0.0);
        }
        let used = total.saturating_sub(available);
        Ok(used as f64 / total as f64 * 100.0)
    }

    fn network_bytes(&self) -> Result<u64> {
        let mut state = self.lock()?;
        state.networks.refresh(true);
        let total = state
            .networks
            .iter()
            .filter(|(name, _)| !is_loopback(name))
            .map(|(_, data)| data.total_received() + data.total_transmitted())
            .sum();
        Ok(total)
    }

    fn temperature(&self) -> Result<ThermalReading> {
        let mut state = self.lock()?;
        state.components.refresh(true);
        for component in state.components.iter() {
            if let Some(temp) = component.temperature() {
                return Ok(ThermalReading {
                    celsius: temp as f64,
                    authoritative: true,
                });
            }
        }
        Ok(ThermalReading {
            celsius: THERMAL_FALLBACK_CELSIUS,
            authoritative: false,
        })
    }

    fn process_memory_bytes(&self) -> Result<u64> {
        let pid = self
            .pid
            .ok_or_else(|| EngineError::probe_failure("current pid unavailable"))?;
        let mut state = self.lock()?;
        state.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        state
            .system
            .process(pid)
            .map(|p| p.memory())
            .ok_or_else(|| EngineError::probe_failure("current process not visible"))
    }

    fn snapshot(&self) -> Result<SystemMetrics> {
        let mut state = self.lock()?;
        state.system.refresh_cpu_usage();
        state.system.refresh_memory();
        state.disks.refresh(true);
        state.networks.refresh(true);

        let cpu = CpuMetrics {
            usage_percent: if state.cpu_primed {
                state.system.global_cpu_usage() as f64
            } else {
                state.cpu_primed = true;
                0.0
            },
            core_count: state.system.cpus().len(),
        };

        let total = state.system.total_memory();
        let available = state.system.available_memory();
        let memory = MemoryMetrics {
            total_bytes: total,
            used_bytes: total.saturating_sub(available),
            available_bytes: available,
            usage_percent: memory_percent_of(&state.system),
        };

        let disk = match root_disk_usage(&state.disks) {
            Some((disk_total, disk_available)) => {
                let used = disk_total.saturating_sub(disk_available);
                DiskMetrics {
                    total_bytes: disk_total,
                    used_bytes: used,
                    available_bytes: disk_available,
                    usage_percent: if disk_total > 0 {
                        used as f64 / disk_total as f64 * 100.0
                    } else {
                        0.0
                    },
                }
            }
            None => DiskMetrics::default(),
        };

        let (rx, tx) = state
            .networks
            .iter()
            .filter(|(name, _)| !is_loopback(name))
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });

        Ok(SystemMetrics {
            timestamp: chrono::Utc::now().timestamp(),
            cpu,
            memory,
            disk,
            network: NetworkMetrics {
                rx_bytes_total: rx,
                tx_bytes_total: tx,
            },
        })
    }
}
