//! CPU stress workload.
//!
//! Spawns one blocking worker per configured thread; each loops over a unit
//! of compute work and shapes its duty cycle to the requested intensity.

use std::hint::black_box;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{duty_cycle_idle, parse_config, IntensityPacer, StressPlugin, IDLE_POLL};
use crate::core::models::{FieldMap, SafetyLimits, TestParams};
use crate::error::{EngineError, Result};

const PRIME_LIMIT: u64 = 10_000;
const FIBONACCI_DEPTH: u64 = 35;
const MATRIX_SIZE: usize = 100;
const PI_SAMPLES: u64 = 1_000_000;
const MAX_WORKERS: usize = 256;

/// Compute kernel run as one unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Prime,
    Fibonacci,
    Matrix,
    Pi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStressConfig {
    /// Worker threads; 0 means one per available core.
    pub workers: usize,
    pub algorithm: Algorithm,
    /// Duty-cycle intensity, 0-100.
    pub intensity: u8,
    /// Scale intensity up over the opening phase of the run.
    pub ramp_up: bool,
}

impl Default for CpuStressConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            algorithm: Algorithm::Prime,
            intensity: 70,
            ramp_up: true,
        }
    }
}

impl CpuStressConfig {
    fn validate(&self) -> Result<()> {
        if self.workers > MAX_WORKERS {
            return Err(EngineError::invalid_config(format!(
                "workers must be at most {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.intensity > 100 {
            return Err(EngineError::invalid_config(format!(
                "intensity must be 0-100, got {}",
                self.intensity
            )));
        }
        Ok(())
    }

    fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

pub struct CpuStressPlugin {
    config: Mutex<CpuStressConfig>,
    total_ops: Arc<AtomicU64>,
    ops_per_sec: Arc<AtomicU64>,
    current_intensity: Arc<AtomicU8>,
    worker_count: AtomicUsize,
}

impl CpuStressPlugin {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(CpuStressConfig::default()),
            total_ops: Arc::new(AtomicU64::new(0)),
            ops_per_sec: Arc::new(AtomicU64::new(0)),
            current_intensity: Arc::new(AtomicU8::new(0)),
            worker_count: AtomicUsize::new(0),
        }
    }
}

impl Default for CpuStressPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StressPlugin for CpuStressPlugin {
    fn name(&self) -> &'static str {
        "cpu-stress"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn description(&self) -> &'static str {
        "CPU stress workload with selectable compute kernels"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "workers": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": MAX_WORKERS,
                    "default": 0,
                    "description": "Number of worker threads (0 = number of CPUs)"
                },
                "algorithm": {
                    "type": "string",
                    "enum": ["prime", "fibonacci", "matrix", "pi"],
                    "default": "prime",
                    "description": "Compute kernel to run"
                },
                "intensity": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 100,
                    "default": 70,
                    "description": "Duty-cycle intensity"
                },
                "ramp_up": {
                    "type": "boolean",
                    "default": true,
                    "description": "Gradually scale intensity up"
                }
            }
        })
    }

    fn initialize(&self, config: &serde_json::Value) -> Result<()> {
        let parsed: CpuStressConfig = parse_config(config)?;
        parsed.validate()?;
        self.worker_count
            .store(parsed.effective_workers(), Ordering::Relaxed);
        *self.config.lock().unwrap() = parsed;
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, params: TestParams) -> Result<()> {
        let config = self.config.lock().unwrap().clone();
        let workers = config.effective_workers();
        self.worker_count.store(workers, Ordering::Relaxed);
        self.total_ops.store(0, Ordering::Relaxed);
        self.ops_per_sec.store(0, Ordering::Relaxed);

        let pacer = IntensityPacer::new(config.intensity, config.ramp_up, params.duration);
        self.current_intensity
            .store(pacer.current(), Ordering::Relaxed);

        // Workers watch a child token so normal completion can stop them
        // without cancelling the execution itself.
        let run = cancel.child_token();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let run = run.clone();
            let algorithm = config.algorithm;
            let intensity = Arc::clone(&self.current_intensity);
            let ops = Arc::clone(&self.total_ops);
            handles.push(tokio::task::spawn_blocking(move || {
                while !run.is_cancelled() {
                    let level = intensity.load(Ordering::Relaxed);
                    if level == 0 {
                        std::thread::sleep(IDLE_POLL);
                        continue;
                    }
                    let started = Instant::now();
                    perform_unit(algorithm);
                    ops.fetch_add(1, Ordering::Relaxed);
                    if let Some(idle) = duty_cycle_idle(level, started.elapsed()) {
                        std::thread::sleep(idle);
                    }
                }
            }));
        }

        let rate_handle = {
            let run = run.clone();
            let total = Arc::clone(&self.total_ops);
            let rate = Arc::clone(&self.ops_per_sec);
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut last = 0u64;
                loop {
                    tokio::select! {
                        _ = run.cancelled() => break,
                        _ = ticker.tick() => {
                            let current = total.load(Ordering::Relaxed);
                            rate.store(current.saturating_sub(last), Ordering::Relaxed);
                            last = current;
                        }
                    }
                }
            })
        };

        let deadline = tokio::time::sleep(params.duration);
        tokio::pin!(deadline);
        let mut pace_ticker = interval(Duration::from_millis(500));
        pace_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(EngineError::Cancelled),
                _ = &mut deadline => break Ok(()),
                _ = pace_ticker.tick() => {
                    self.current_intensity.store(pacer.current(), Ordering::Relaxed);
                }
            }
        };

        run.cancel();
        let _ = rate_handle.await;

        let mut fault = None;
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    fault = Some(EngineError::plugin_fault(format!("cpu worker panicked: {err}")));
                }
            }
        }
        match fault {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    fn cleanup(&self) -> Result<()> {
        self.current_intensity.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn current_metrics(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "ops_per_sec".into(),
            self.ops_per_sec.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "total_operations".into(),
            self.total_ops.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "worker_count".into(),
            self.worker_count.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "current_intensity".into(),
            u64::from(self.current_intensity.load(Ordering::Relaxed)).into(),
        );
        fields
    }

    fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_cpu_percent: 95.0,
            max_memory_percent: 20.0,
            max_disk_percent: 50.0,
            max_network_mbps: 10.0,
        }
    }

    fn health_check(&self) -> Result<()> {
        let result = fibonacci(10);
        if result != 55 {
            return Err(EngineError::plugin_fault(format!(
                "cpu health check failed: expected 55, got {result}"
            )));
        }
        Ok(())
    }
}

fn perform_unit(algorithm: Algorithm) {
    match algorithm {
        Algorithm::Prime => black_box(count_primes(PRIME_LIMIT)),
        Algorithm::Fibonacci => black_box(fibonacci(FIBONACCI_DEPTH)),
        Algorithm::Matrix => black_box(matrix_multiply(MATRIX_SIZE)),
        Algorithm::Pi => black_box(estimate_pi(PI_SAMPLES) as u64),
    };
}

/// Count primes up to `limit` by trial division.
fn count_primes(limit: u64) -> u64 {
    let mut count = 0;
    for candidate in 2..=limit {
        let mut is_prime = true;
        let mut divisor = 2;
        while divisor * divisor <= candidate {
            if candidate % divisor == 0 {
                is_prime = false;
                break;
            }
            divisor += 1;
        }
        if is_prime {
            count += 1;
        }
    }
    count
}

fn fibonacci(n: u64) -> u64 {
    if n <= 1 {
        n
    } else {
        fibonacci(n - 1) + fibonacci(n - 2)
    }
}

/// Multiply two dense size x size matrices, returning a checksum.
fn matrix_multiply(size: usize) -> u64 {
    let a: Vec<f64> = (0..size * size)
        .map(|i| (i / size + i % size) as f64)
        .collect();
    let b: Vec<f64> = (0..size * size)
        .map(|i| ((i / size) * (i % size)) as f64)
        .collect();
    let mut result = vec![0.0f64; size * size];

    for i in 0..size {
        for j in 0..size {
            let mut sum = 0.0;
            for k in 0..size {
                sum += a[i * size + k] * b[k * size + j];
            }
            result[i * size + j] = sum;
        }
    }

    result.iter().sum::<f64>() as u64
}

/// Estimate pi by sampling the unit square.
fn estimate_pi(samples: u64) -> f64 {
    let mut rng = rand::thread_rng();
    let mut inside = 0u64;
    for _ in 0..samples {
        let x: f64 = rng.gen();
        let y: f64 = rng.gen();
        if x * x + y * y <= 1.0 {
            inside += 1;
        }
    }
    4.0 * inside as f64 / samples as f64
}
