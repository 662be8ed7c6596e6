//! Metrics collection: periodic host sampling plus per-execution series.
//!
//! The latest host snapshot lives in a watch channel, so readers always see
//! a whole snapshot (the previous or the new one, never a torn write).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{EngineEvent, EventBus};
use super::history::MetricsHistory;
use super::models::{FieldMap, MetricPoint, SystemMetrics};
use crate::probe::SystemProbe;
use crate::workloads::StressPlugin;

/// Sampling cadences.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Global host sampling interval.
    pub collection_interval: Duration,
    /// Per-execution sampling interval.
    pub execution_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(5),
            execution_interval: Duration::from_secs(1),
        }
    }
}

/// Samples the probe, caches the latest snapshot, and feeds per-execution
/// metric buffers and the event bus.
pub struct MetricsCollector {
    probe: Arc<dyn SystemProbe>,
    config: CollectorConfig,
    bus: EventBus,
    latest_tx: watch::Sender<Arc<SystemMetrics>>,
    history: Arc<Mutex<MetricsHistory>>,
    global_cancel: Mutex<Option<CancellationToken>>,
    collections: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl MetricsCollector {
    pub fn new(probe: Arc<dyn SystemProbe>, config: CollectorConfig, bus: EventBus) -> Self {
        let (latest_tx, _) = watch::channel(Arc::new(SystemMetrics::default()));
        Self {
            probe,
            config,
            bus,
            latest_tx,
            history: Arc::new(Mutex::new(MetricsHistory::new())),
            global_cancel: Mutex::new(None),
            collections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin periodic global sampling. Calling twice is a no-op.
    pub fn start(&self) {
        let mut guard = self.global_cancel.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());

        let probe = Arc::clone(&self.probe);
        let bus = self.bus.clone();
        let latest = self.latest_tx.clone();
        let history = Arc::clone(&self.history);
        let period = self.config.collection_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match probe.snapshot() {
                            Ok(snapshot) => {
                                history.lock().unwrap().push_sample(&snapshot);
                                let snapshot = Arc::new(snapshot);
                                latest.send_replace(Arc::clone(&snapshot));
                                bus.publish(EngineEvent::SystemSample(snapshot));
                            }
                            Err(err) => {
                                // Previous snapshot stays in place.
                                log::warn!("system metrics sample failed: {err}");
                            }
                        }
                    }
                }
            }
        });
    }

    /// End periodic global sampling. The last snapshot remains readable.
    pub fn stop(&self) {
        if let Some(token) = self.global_cancel.lock().unwrap().take() {
            token.cancel();
        }
    }

    /// The most recent host snapshot.
    pub fn latest(&self) -> Arc<SystemMetrics> {
        self.latest_tx.borrow().clone()
    }

    /// Watch the snapshot cell directly.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SystemMetrics>> {
        self.latest_tx.subscribe()
    }

    /// Copy of the recent-sample ring filled by global sampling.
    pub fn history(&self) -> MetricsHistory {
        self.history.lock().unwrap().clone()
    }

    /// Begin per-execution sampling: on each tick, one system point and one
    /// plugin-counters point are appended to `buffer` and published on the
    /// bus. Stops when `parent` is cancelled or
    /// [`stop_collection`](Self::stop_collection) is called.
    pub fn start_collection(
        &self,
        execution_id: Uuid,
        plugin: Arc<dyn StressPlugin>,
        buffer: Arc<Mutex<Vec<MetricPoint>>>,
        parent: &CancellationToken,
    ) {
        let token = parent.child_token();
        if let Some(previous) = self
            .collections
            .lock()
            .unwrap()
            .insert(execution_id, token.clone())
        {
            previous.cancel();
        }

        let probe = Arc::clone(&self.probe);
        let bus = self.bus.clone();
        let collections = Arc::clone(&self.collections);
        let period = self.config.execution_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();

                        match probe.snapshot() {
                            Ok(snapshot) => {
                                let fields = snapshot.to_fields();
                                buffer.lock().unwrap().push(MetricPoint {
                                    timestamp: now,
                                    execution_id,
                                    source: "system".into(),
                                    kind: "system".into(),
                                    tags: Default::default(),
                                    fields: fields.clone(),
                                });
                                bus.publish(EngineEvent::ExecutionSample {
                                    execution_id,
                                    source: "system".into(),
                                    fields,
                                });
                            }
                            Err(err) => log::warn!(
                                "execution {execution_id} system sample failed: {err}"
                            ),
                        }

                        let fields = plugin.current_metrics();
                        if !fields.is_empty() {
                            buffer.lock().unwrap().push(MetricPoint {
                                timestamp: now,
                                execution_id,
                                source: plugin.name().into(),
                                kind: "plugin".into(),
                                tags: Default::default(),
                                fields: fields.clone(),
                            });
                            bus.publish(EngineEvent::ExecutionSample {
                                execution_id,
                                source: plugin.name().into(),
                                fields,
                            });
                        }
                    }
                }
            }
            collections.lock().unwrap().remove(&execution_id);
        });
    }

    /// End per-execution sampling for `execution_id`. Unknown ids are a no-op.
    pub fn stop_collection(&self, execution_id: Uuid) {
        if let Some(token) = self.collections.lock().unwrap().remove(&execution_id) {
            token.cancel();
        }
    }

    /// Snapshot of a plugin's counters, stamped with the collection time.
    pub fn collect_plugin_metrics(&self, plugin: &dyn StressPlugin) -> FieldMap {
        let mut fields = plugin.current_metrics();
        fields.insert("collected_at".into(), Utc::now().timestamp().into());
        fields
    }
}
