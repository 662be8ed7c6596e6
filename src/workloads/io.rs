//! Disk I/O stress workload.
//!
//! Each worker owns one scratch file and repeatedly issues block-sized reads
//! and writes against it. Operation failures are counted, never fatal.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{parse_config, ByteSize, StressPlugin};
use crate::core::models::{FieldMap, SafetyLimits, TestParams};
use crate::error::{EngineError, Result};

const MAX_WORKERS: usize = 32;
/// Pause between operations so a single worker cannot saturate the device.
const OP_PAUSE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    Read,
    Write,
    #[default]
    Mixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IoStressConfig {
    pub file_size: ByteSize,
    pub block_size: ByteSize,
    pub operations: IoMode,
    pub workers: usize,
    /// Flush after every write.
    pub fsync: bool,
    /// Request unbuffered I/O; falls back to synchronous writes where the
    /// platform offers nothing stronger.
    pub direct: bool,
    /// Directory for scratch files; platform temp when unset.
    pub temp_dir: Option<PathBuf>,
    /// Sequential (offset zero) versus uniformly random offsets.
    pub sequential: bool,
    /// Probability of a read per operation in mixed mode.
    pub read_write_ratio: f64,
}

impl Default for IoStressConfig {
    fn default() -> Self {
        Self {
            file_size: ByteSize(ByteSize::GIB),
            block_size: ByteSize(64 * ByteSize::KIB),
            operations: IoMode::Mixed,
            workers: 4,
            fsync: false,
            direct: false,
            temp_dir: None,
            sequential: true,
            read_write_ratio: 0.5,
        }
    }
}

impl IoStressConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(EngineError::invalid_config(format!(
                "workers must be 1-{MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.block_size.bytes() == 0 {
            return Err(EngineError::invalid_config("block_size must be non-zero"));
        }
        if self.block_size.bytes() > self.file_size.bytes() {
            return Err(EngineError::invalid_config(
                "block_size must not exceed file_size",
            ));
        }
        if !(0.0..=1.0).contains(&self.read_write_ratio) {
            return Err(EngineError::invalid_config(format!(
                "read_write_ratio must be 0.0-1.0, got {}",
                self.read_write_ratio
            )));
        }
        let dir = self.resolved_temp_dir();
        if !dir.is_dir() {
            return Err(EngineError::invalid_config(format!(
                "temp directory does not exist: {}",
                dir.display()
            )));
        }
        Ok(())
    }

    fn resolved_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Sync every write when fsync is on, or as the fallback for direct I/O.
    fn sync_writes(&self) -> bool {
        self.fsync || self.direct
    }
}

#[derive(Default)]
struct IoCounters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    errors: AtomicU64,
    latency_ns_total: AtomicU64,
    latency_samples: AtomicU64,
    read_bytes_per_sec: AtomicU64,
    write_bytes_per_sec: AtomicU64,
    iops: AtomicU64,
    direct_fallback: AtomicBool,
}

impl IoCounters {
    fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latency_ns_total.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
        self.read_bytes_per_sec.store(0, Ordering::Relaxed);
        self.write_bytes_per_sec.store(0, Ordering::Relaxed);
        self.iops.store(0, Ordering::Relaxed);
        self.direct_fallback.store(false, Ordering::Relaxed);
    }

    fn avg_latency_ms(&self) -> f64 {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        self.latency_ns_total.load(Ordering::Relaxed) as f64 / samples as f64 / 1_000_000.0
    }
}

pub struct IoStressPlugin {
    config: Mutex<IoStressConfig>,
    scratch_files: Arc<Mutex<Vec<PathBuf>>>,
    counters: Arc<IoCounters>,
}

impl IoStressPlugin {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(IoStressConfig::default()),
            scratch_files: Arc::new(Mutex::new(Vec::new())),
            counters: Arc::new(IoCounters::default()),
        }
    }

    /// Create one scratch file per worker, written in block-sized chunks of
    /// random data. Partial files are registered immediately so cleanup can
    /// remove them after a cancellation.
    async fn prepare_files(
        &self,
        cancel: &CancellationToken,
        config: &IoStressConfig,
    ) -> Result<Vec<PathBuf>> {
        let dir = config.resolved_temp_dir();
        let stamp = chrono::Utc::now().timestamp();
        let mut paths = Vec::with_capacity(config.workers);

        for worker in 0..config.workers {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let path = dir.join(format!("stressforge_io_{stamp}_{worker}.dat"));
            self.scratch_files.lock().unwrap().push(path.clone());

            let file_size = config.file_size.bytes();
            let block_size = config.block_size.bytes() as usize;
            let sync_writes = config.sync_writes();
            let token = cancel.clone();
            let target = path.clone();
            let written = tokio::task::spawn_blocking(move || {
                write_scratch_file(&target, file_size, block_size, sync_writes, &token)
            })
            .await
            .map_err(|err| EngineError::plugin_fault(format!("file preparation panicked: {err}")))?
            .map_err(|err| {
                EngineError::resource_unavailable(format!(
                    "failed to create scratch file {}: {err}",
                    path.display()
                ))
            })?;

            if !written {
                return Err(EngineError::Cancelled);
            }
            paths.push(path);
        }
        Ok(paths)
    }
}

impl Default for IoStressPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns Ok(false) when interrupted by cancellation.
fn write_scratch_file(
    path: &PathBuf,
    file_size: u64,
    block_size: usize,
    sync_writes: bool,
    token: &CancellationToken,
) -> std::io::Result<bool> {
    let mut file = File::create(path)?;
    let mut buffer = vec![0u8; block_size];
    let mut rng = rand::thread_rng();
    let mut written = 0u64;

    while written < file_size {
        if token.is_cancelled() {
            return Ok(false);
        }
        let remaining = (file_size - written).min(block_size as u64) as usize;
        rng.fill(&mut buffer[..remaining]);
        file.write_all(&buffer[..remaining])?;
        written += remaining as u64;
        if sync_writes {
            file.sync_all()?;
        }
    }
    Ok(true)
}

struct WorkerShared {
    counters: Arc<IoCounters>,
    mode: IoMode,
    sequential: bool,
    read_write_ratio: f64,
    file_size: u64,
    block_size: u64,
    sync_writes: bool,
}

fn io_worker(path: PathBuf, shared: WorkerShared, run: CancellationToken) {
    let file = OpenOptions::new().read(true).write(true).open(&path);
    let mut file = match file {
        Ok(file) => file,
        Err(err) => {
            log::warn!("io worker could not open {}: {err}", path.display());
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let block = shared.block_size as usize;
    let mut buffer = vec![0u8; block];
    let mut rng = rand::thread_rng();
    let max_offset = shared.file_size.saturating_sub(shared.block_size);

    while !run.is_cancelled() {
        let read = match shared.mode {
            IoMode::Read => true,
            IoMode::Write => false,
            IoMode::Mixed => rng.gen::<f64>() < shared.read_write_ratio,
        };
        let offset = if shared.sequential {
            0
        } else if max_offset > 0 {
            rng.gen_range(0..=max_offset)
        } else {
            0
        };

        let started = Instant::now();
        let result = if read {
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.read(&mut buffer))
        } else {
            rng.fill(&mut buffer[..]);
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.write(&buffer))
                .and_then(|n| {
                    if shared.sync_writes {
                        file.sync_all()?;
                    }
                    Ok(n)
                })
        };

        match result {
            Ok(n) => {
                let elapsed = started.elapsed().as_nanos() as u64;
                shared
                    .counters
                    .latency_ns_total
                    .fetch_add(elapsed, Ordering::Relaxed);
                shared
                    .counters
                    .latency_samples
                    .fetch_add(1, Ordering::Relaxed);
                if read {
                    shared
                        .counters
                        .bytes_read
                        .fetch_add(n as u64, Ordering::Relaxed);
                    shared.counters.read_ops.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared
                        .counters
                        .bytes_written
                        .fetch_add(n as u64, Ordering::Relaxed);
                    shared.counters.write_ops.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(err) => {
                log::debug!("io operation failed on {}: {err}", path.display());
                shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        std::thread::sleep(OP_PAUSE);
    }
}

#[async_trait]
impl StressPlugin for IoStressPlugin {
    fn name(&self) -> &'static str {
        "io-stress"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn description(&self) -> &'static str {
        "Disk and file system stress workload"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_size": {
                    "type": ["integer", "string"],
                    "default": "1GB",
                    "description": "Size of each scratch file"
                },
                "block_size": {
                    "type": ["integer", "string"],
                    "default": "64KB",
                    "description": "I/O block size"
                },
                "operations": {
                    "type": "string",
                    "enum": ["read", "write", "mixed"],
                    "default": "mixed"
                },
                "workers": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_WORKERS,
                    "default": 4
                },
                "fsync": {
                    "type": "boolean",
                    "default": false,
                    "description": "Flush after every write"
                },
                "direct": {
                    "type": "boolean",
                    "default": false,
                    "description": "Request unbuffered I/O"
                },
                "temp_dir": {
                    "type": "string",
                    "description": "Directory for scratch files (platform temp by default)"
                },
                "sequential": {
                    "type": "boolean",
                    "default": true
                },
                "read_write_ratio": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "default": 0.5,
                    "description": "Probability of a read per mixed-mode operation"
                }
            }
        })
    }

    fn initialize(&self, config: &serde_json::Value) -> Result<()> {
        let parsed: IoStressConfig = parse_config(config)?;
        parsed.validate()?;
        *self.config.lock().unwrap() = parsed;
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, params: TestParams) -> Result<()> {
        let config = self.config.lock().unwrap().clone();
        self.counters.reset();
        // Plain std::fs has no portable unbuffered mode, so a direct request
        // degrades to per-write sync and the fallback is surfaced in metrics.
        if config.direct {
            self.counters.direct_fallback.store(true, Ordering::Relaxed);
        }

        let paths = self.prepare_files(&cancel, &config).await?;

        let run = cancel.child_token();
        let mut handles = Vec::with_capacity(paths.len());
        for path in paths {
            let shared = WorkerShared {
                counters: Arc::clone(&self.counters),
                mode: config.operations,
                sequential: config.sequential,
                read_write_ratio: config.read_write_ratio,
                file_size: config.file_size.bytes(),
                block_size: config.block_size.bytes(),
                sync_writes: config.sync_writes(),
            };
            let run = run.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                io_worker(path, shared, run)
            }));
        }

        let rate_handle = {
            let run = run.clone();
            let counters = Arc::clone(&self.counters);
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let (mut last_read, mut last_written) = (0u64, 0u64);
                let mut last_ops = 0u64;
                loop {
                    tokio::select! {
                        _ = run.cancelled() => break,
                        _ = ticker.tick() => {
                            let read = counters.bytes_read.load(Ordering::Relaxed);
                            let written = counters.bytes_written.load(Ordering::Relaxed);
                            let ops = counters.read_ops.load(Ordering::Relaxed)
                                + counters.write_ops.load(Ordering::Relaxed);
                            counters.read_bytes_per_sec
                                .store(read.saturating_sub(last_read), Ordering::Relaxed);
                            counters.write_bytes_per_sec
                                .store(written.saturating_sub(last_written), Ordering::Relaxed);
                            counters.iops.store(ops.saturating_sub(last_ops), Ordering::Relaxed);
                            last_read = read;
                            last_written = written;
                            last_ops = ops;
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(params.duration) => Ok(()),
        };

        run.cancel();
        let _ = rate_handle.await;

        let mut fault = None;
        for handle in handles {
            if let Err(err) = handle.await {
                if err.is_panic() {
                    fault = Some(EngineError::plugin_fault(format!(
                        "io worker panicked: {err}"
                    )));
                }
            }
        }
        match fault {
            Some(err) => Err(err),
            None => outcome,
        }
    }

    fn cleanup(&self) -> Result<()> {
        let mut files = self.scratch_files.lock().unwrap();
        for path in files.drain(..) {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove scratch file {}: {err}", path.display());
            }
        }
        Ok(())
    }

    fn current_metrics(&self) -> FieldMap {
        let c = &self.counters;
        let mut fields = FieldMap::new();
        fields.insert(
            "total_bytes_read".into(),
            c.bytes_read.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "total_bytes_written".into(),
            c.bytes_written.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "read_ops".into(),
            c.read_ops.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "write_ops".into(),
            c.write_ops.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "read_bytes_per_sec".into(),
            c.read_bytes_per_sec.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "write_bytes_per_sec".into(),
            c.write_bytes_per_sec.load(Ordering::Relaxed).into(),
        );
        fields.insert("iops".into(), c.iops.load(Ordering::Relaxed).into());
        fields.insert("avg_latency_ms".into(), c.avg_latency_ms().into());
        fields.insert(
            "error_count".into(),
            c.errors.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "direct_fallback".into(),
            c.direct_fallback.load(Ordering::Relaxed).into(),
        );
        fields
    }

    fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_cpu_percent: 30.0,
            max_memory_percent: 20.0,
            max_disk_percent: 95.0,
            max_network_mbps: 10.0,
        }
    }

    fn health_check(&self) -> Result<()> {
        let dir = self.config.lock().unwrap().resolved_temp_dir();
        let path = dir.join("stressforge_health_check.tmp");

        let check = (|| -> std::io::Result<()> {
            let payload = b"stressforge io health check";
            fs::write(&path, payload)?;
            let mut buffer = Vec::new();
            File::open(&path)?.read_to_end(&mut buffer)?;
            if buffer != payload {
                return Err(std::io::Error::other("payload mismatch"));
            }
            Ok(())
        })();

        let _ = fs::remove_file(&path);
        check.map_err(|err| EngineError::plugin_fault(format!("io health check failed: {err}")))
    }
}
