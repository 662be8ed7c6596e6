use std::collections::VecDeque;

use super::models::SystemMetrics;

const DEFAULT_HISTORY_SIZE: usize = 60;

/// Bounded ring of recent host samples, one slot per collector tick.
#[derive(Debug, Clone)]
pub struct MetricsHistory {
    capacity: usize,
    pub cpu_usage: VecDeque<f64>,
    pub memory_usage: VecDeque<f64>,
    pub disk_usage: VecDeque<f64>,
    pub network_rx: VecDeque<u64>,
    pub network_tx: VecDeque<u64>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            cpu_usage: VecDeque::with_capacity(capacity),
            memory_usage: VecDeque::with_capacity(capacity),
            disk_usage: VecDeque::with_capacity(capacity),
            network_rx: VecDeque::with_capacity(capacity),
            network_tx: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push_sample(&mut self, sample: &SystemMetrics) {
        let capacity = self.capacity;
        Self::push_value(&mut self.cpu_usage, sample.cpu.usage_percent, capacity);
        Self::push_value(&mut self.memory_usage, sample.memory.usage_percent, capacity);
        Self::push_value(&mut self.disk_usage, sample.disk.usage_percent, capacity);
        Self::push_value(&mut self.network_rx, sample.network.rx_bytes_total, capacity);
        Self::push_value(&mut self.network_tx, sample.network.tx_bytes_total, capacity);
    }

    fn push_value<T>(queue: &mut VecDeque<T>, value: T, capacity: usize) {
        if queue.len() >= capacity {
            queue.pop_front();
        }
        queue.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.cpu_usage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpu_usage.is_empty()
    }

    pub fn average_cpu(&self) -> f64 {
        average(&self.cpu_usage)
    }

    pub fn average_memory(&self) -> f64 {
        average(&self.memory_usage)
    }

    pub fn peak_cpu(&self) -> f64 {
        self.cpu_usage.iter().copied().fold(0.0, f64::max)
    }
}

impl Default for MetricsHistory {
    fn default() -> Self {
        Self::new()
    }
}

fn average(values: &VecDeque<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
