//! Memory stress workload.
//!
//! Allocates a configurable amount of memory in chunks, initialises it with
//! one of three patterns, then hammers it with concurrent read/write workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{parse_config, ByteSize, StressPlugin};
use crate::core::models::{FieldMap, SafetyLimits, TestParams};
use crate::error::{EngineError, Result};

const ACCESS_WINDOW: usize = 1024;
const FRAGMENT_BLOCK: usize = 4096;
const MAX_WORKERS: usize = 64;
/// Pause between chunk allocations so the allocator is not hammered.
const ALLOC_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPattern {
    #[default]
    Sequential,
    Random,
    Fragmented,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Read,
    Write,
    #[default]
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStressConfig {
    /// Total amount of memory to allocate.
    pub alloc_size: ByteSize,
    /// Size of each individual allocation.
    pub chunk_size: ByteSize,
    pub pattern: MemoryPattern,
    pub access_type: AccessType,
    pub workers: usize,
    /// Delay between accesses, in milliseconds.
    #[serde(rename = "access_delay")]
    pub access_delay_ms: u64,
}

impl Default for MemoryStressConfig {
    fn default() -> Self {
        Self {
            alloc_size: ByteSize(ByteSize::GIB),
            chunk_size: ByteSize(64 * ByteSize::MIB),
            pattern: MemoryPattern::Sequential,
            access_type: AccessType::ReadWrite,
            workers: 4,
            access_delay_ms: 10,
        }
    }
}

impl MemoryStressConfig {
    fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            return Err(EngineError::invalid_config(format!(
                "workers must be 1-{MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.chunk_size.bytes() == 0 {
            return Err(EngineError::invalid_config("chunk_size must be non-zero"));
        }
        if self.alloc_size.bytes() == 0 {
            return Err(EngineError::invalid_config("alloc_size must be non-zero"));
        }
        if self.access_delay_ms > 1000 {
            return Err(EngineError::invalid_config(format!(
                "access_delay must be at most 1000ms, got {}",
                self.access_delay_ms
            )));
        }
        Ok(())
    }

    fn chunk_count(&self) -> u64 {
        self.alloc_size.bytes().div_ceil(self.chunk_size.bytes()).max(1)
    }
}

pub struct MemoryStressPlugin {
    config: Mutex<MemoryStressConfig>,
    chunks: Arc<RwLock<Vec<Mutex<Vec<u8>>>>>,
    allocated_mb: Arc<AtomicU64>,
    access_count: Arc<AtomicU64>,
    access_latency_ns: Arc<AtomicU64>,
    alloc_rate_mb: Arc<AtomicU64>,
}

impl MemoryStressPlugin {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(MemoryStressConfig::default()),
            chunks: Arc::new(RwLock::new(Vec::new())),
            allocated_mb: Arc::new(AtomicU64::new(0)),
            access_count: Arc::new(AtomicU64::new(0)),
            access_latency_ns: Arc::new(AtomicU64::new(0)),
            alloc_rate_mb: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn allocate(
        &self,
        cancel: &CancellationToken,
        config: &MemoryStressConfig,
    ) -> Result<()> {
        let chunk_bytes = config.chunk_size.bytes() as usize;
        let chunk_count = config.chunk_count();

        for index in 0..chunk_count {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let mut chunk = Vec::new();
            chunk.try_reserve_exact(chunk_bytes).map_err(|_| {
                EngineError::resource_unavailable(format!(
                    "failed to allocate {chunk_bytes} byte chunk"
                ))
            })?;
            chunk.resize(chunk_bytes, 0);
            initialise_chunk(&mut chunk, config.pattern, index as usize);

            self.chunks.write().unwrap().push(Mutex::new(chunk));
            self.allocated_mb
                .fetch_add(config.chunk_size.whole_mib(), Ordering::Relaxed);

            tokio::time::sleep(ALLOC_PAUSE).await;
        }
        Ok(())
    }
}

impl Default for MemoryStressPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn initialise_chunk(chunk: &mut [u8], pattern: MemoryPattern, chunk_index: usize) {
    match pattern {
        MemoryPattern::Sequential => {
            for (i, byte) in chunk.iter_mut().enumerate() {
                *byte = (i % 256) as u8;
            }
        }
        MemoryPattern::Random => {
            rand::thread_rng().fill(chunk);
        }
        MemoryPattern::Fragmented => {
            // Touch every other 4 KiB block, offset by the chunk index so
            // the populated blocks interleave across chunks.
            for (block, slice) in chunk.chunks_mut(FRAGMENT_BLOCK).enumerate() {
                if (block + chunk_index) % 2 == 0 {
                    for (i, byte) in slice.iter_mut().enumerate() {
                        *byte = (i % 256) as u8;
                    }
                }
            }
        }
    }
}

/// One random 1 KiB access against a randomly chosen chunk.
/// Returns false when no chunks are available yet.
fn perform_access(
    chunks: &RwLock<Vec<Mutex<Vec<u8>>>>,
    access_type: AccessType,
) -> bool {
    let guard = chunks.read().unwrap();
    if guard.is_empty() {
        return false;
    }
    let mut rng = rand::thread_rng();
    let chunk = &guard[rng.gen_range(0..guard.len())];
    let mut data = chunk.lock().unwrap();
    if data.len() <= ACCESS_WINDOW {
        return false;
    }
    let offset = rng.gen_range(0..data.len() - ACCESS_WINDOW);

    let read = match access_type {
        AccessType::Read => true,
        AccessType::Write => false,
        AccessType::ReadWrite => rng.gen_bool(0.5),
    };
    if read {
        let sum: u64 = data[offset..offset + ACCESS_WINDOW]
            .iter()
            .map(|&b| u64::from(b))
            .sum();
        std::hint::black_box(sum);
    } else {
        let value = rng.gen::<u8>();
        data[offset..offset + ACCESS_WINDOW].fill(value);
    }
    true
}

#[async_trait]
impl StressPlugin for MemoryStressPlugin {
    fn name(&self) -> &'static str {
        "memory-stress"
    }

    fn version(&self) -> &'static str {
        "1.0.0"
    }

    fn description(&self) -> &'static str {
        "Memory stress workload with configurable allocation patterns"
    }

    fn config_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "alloc_size": {
                    "type": ["integer", "string"],
                    "default": "1GB",
                    "description": "Total memory to allocate (bytes or e.g. \"512MB\")"
                },
                "chunk_size": {
                    "type": ["integer", "string"],
                    "default": "64MB",
                    "description": "Size of individual chunks"
                },
                "pattern": {
                    "type": "string",
                    "enum": ["sequential", "random", "fragmented"],
                    "default": "sequential"
                },
                "access_type": {
                    "type": "string",
                    "enum": ["read", "write", "readwrite"],
                    "default": "readwrite"
                },
                "workers": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_WORKERS,
                    "default": 4
                },
                "access_delay": {
                    "type": "integer",
                    "minimum": 0,
                    "maximum": 1000,
                    "default": 10,
                    "description": "Delay between accesses in milliseconds"
                }
            }
        })
    }

    fn initialize(&self, config: &serde_json::Value) -> Result<()> {
        let parsed: MemoryStressConfig = parse_config(config)?;
        parsed.validate()?;
        *self.config.lock().unwrap() = parsed;
        Ok(())
    }

    async fn execute(&self, cancel: CancellationToken, params: TestParams) -> Result<()> {
        let config = self.config.lock().unwrap().clone();
        self.allocated_mb.store(0, Ordering::Relaxed);
        self.access_count.store(0, Ordering::Relaxed);
        self.access_latency_ns.store(0, Ordering::Relaxed);
        self.chunks.write().unwrap().clear();

        self.allocate(&cancel, &config).await?;

        let run = cancel.child_token();
        let delay = Duration::from_millis(config.access_delay_ms);

        let mut handles = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let run = run.clone();
            let chunks = Arc::clone(&self.chunks);
            let access_type = config.access_type;
            let count = Arc::clone(&self.access_count);
            let latency = Arc::clone(&self.access_latency_ns);
            handles.push(tokio::spawn(async move {
                loop {
                    if run.is_cancelled() {
                        break;
                    }
                    let started = Instant::now();
                    if perform_access(&chunks, access_type) {
                        latency.store(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::select! {
                            _ = run.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }));
        }

        let rate_handle = {
            let run = run.clone();
            let allocated = Arc::clone(&self.allocated_mb);
            let rate = Arc::clone(&self.alloc_rate_mb);
            tokio::spawn(async move {
                let mut ticker = interval(Duration::from_secs(1));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut last = 0u64;
                loop {
                    tokio::select! {
                        _ = run.cancelled() => break,
                        _ = ticker.tick() => {
                            let current = allocated.load(Ordering::Relaxed);
                            rate.store(current.saturating_sub(last), Ordering::Relaxed);
                            last = current;
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
                        "memory worker panicked: {err}"
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
        // Counters keep their last observed values; only the buffers go.
        self.chunks.write().unwrap().clear();
        Ok(())
    }

    fn current_metrics(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(
            "allocated_mb".into(),
            self.allocated_mb.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "access_count".into(),
            self.access_count.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "access_latency_ns".into(),
            self.access_latency_ns.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "alloc_rate_mb_per_sec".into(),
            self.alloc_rate_mb.load(Ordering::Relaxed).into(),
        );
        fields.insert(
            "num_chunks".into(),
            self.chunks.read().unwrap().len().into(),
        );
        fields
    }

    fn safety_limits(&self) -> SafetyLimits {
        SafetyLimits {
            max_cpu_percent: 30.0,
            max_memory_percent: 85.0,
            max_disk_percent: 50.0,
            max_network_mbps: 10.0,
        }
    }

    fn health_check(&self) -> Result<()> {
        let mut buffer = vec![0u8; 1024];
        initialise_chunk(&mut buffer, MemoryPattern::Sequential, 0);
        for (i, &byte) in buffer.iter().enumerate() {
            if byte != (i % 256) as u8 {
                return Err(EngineError::plugin_fault(
                    "memory health check failed: data corruption detected",
                ));
            }
        }
        Ok(())
    }
}
